use crate::protocol::commands::{UPLOAD_COMPLETE, UPLOAD_FAILED, UPLOAD_PARTIAL_PREFIX};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistributionStatus {
    Complete,
    Partial,
    Failed,
}

/// What one upload achieved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributionReport {
    pub file_name: String,
    /// Parts the file was cut into.
    pub planned: usize,
    /// Parts acknowledged by a node and recorded in the mapping.
    pub stored: usize,
    /// Parts with no node to go to.
    pub unassigned: usize,
    /// Parts whose send failed.
    pub failed: usize,
}

impl DistributionReport {
    pub fn new(file_name: impl Into<String>, planned: usize) -> Self {
        Self {
            file_name: file_name.into(),
            planned,
            stored: 0,
            unassigned: 0,
            failed: 0,
        }
    }

    pub fn status(&self) -> DistributionStatus {
        if self.stored == 0 {
            DistributionStatus::Failed
        } else if self.stored == self.planned {
            DistributionStatus::Complete
        } else {
            DistributionStatus::Partial
        }
    }

    /// Reply sent to the uploading client.
    pub fn reply_message(&self) -> String {
        match self.status() {
            DistributionStatus::Complete => UPLOAD_COMPLETE.to_string(),
            DistributionStatus::Partial => format!(
                "{}{}/{} parties stockées.",
                UPLOAD_PARTIAL_PREFIX, self.stored, self.planned
            ),
            DistributionStatus::Failed => UPLOAD_FAILED.to_string(),
        }
    }
}
