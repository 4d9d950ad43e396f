//! Command Vocabulary
//!
//! Command names and fixed response strings exchanged over the wire. The strings are
//! part of the protocol: existing clients match on them byte for byte.

// --- Coordinator commands ---

pub const CMD_LIST: &str = "list";
pub const CMD_UPLOAD: &str = "upload";
pub const CMD_DOWNLOAD: &str = "download";
pub const CMD_DELETE_FILE: &str = "DELETE_FILE";
pub const CMD_REPLICATION_INFO: &str = "REPLICATION_INFO";

// --- Storage node commands ---

pub const CMD_STORE: &str = "store";
pub const CMD_GET_PART: &str = "GET_PART";
pub const CMD_DELETE_PART: &str = "DELETE_PART";

// --- Discovery ---

/// Broadcast probe sent by the coordinator to every storage node.
pub const REQUEST_INFO: &str = "REQUEST_INFO";

// --- Responses ---

pub const UNKNOWN_COMMAND: &str = "Commande non reconnue";
pub const SUCCESS: &str = "SUCCESS";
pub const FAILURE: &str = "FAILURE";
pub const PART_FOUND: &str = "PART_FOUND";
pub const PART_NOT_FOUND: &str = "PART_NOT_FOUND";
pub const STORE_ACK: &str = "Fichier reçu et sauvegardé avec succès.";
pub const STORE_ERROR_PREFIX: &str = "Erreur lors de la réception du fichier : ";
pub const REPLICATION_INFO_ACK: &str = "Replication info stored successfully";
pub const LIST_PREFIX: &str = "Fichiers disponibles : ";
pub const LIST_SEPARATOR: &str = ", ";
pub const DOWNLOAD_PREFIX: &str = "Downloading:";
pub const DOWNLOAD_ERROR_PREFIX: &str = "Erreur lors du téléchargement : ";
pub const NO_PARTS_PREFIX: &str = "Aucune partie trouvée pour ";
pub const FILE_NOT_FOUND: &str = "Fichier introuvable dans le mapping.";
pub const DELETE_ERROR_PREFIX: &str = "Erreur lors de la suppression : ";
pub const UPLOAD_COMPLETE: &str = "Fichier distribué avec succès.";
pub const UPLOAD_PARTIAL_PREFIX: &str = "Fichier partiellement distribué : ";
pub const UPLOAD_FAILED: &str = "Échec de la distribution du fichier : aucune partie stockée.";
pub const INVALID_FILE_NAME_PREFIX: &str = "Nom de fichier invalide : ";
pub const REPLICATION_INFO_ERROR_PREFIX: &str = "Information de réplication invalide : ";

/// Commands accepted on the coordinator's client port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorCommand {
    List,
    Upload,
    Download,
    DeleteFile,
    ReplicationInfo,
}

impl CoordinatorCommand {
    pub fn from_wire(command: &str) -> Option<Self> {
        match command {
            CMD_LIST => Some(Self::List),
            CMD_UPLOAD => Some(Self::Upload),
            CMD_DOWNLOAD => Some(Self::Download),
            CMD_DELETE_FILE => Some(Self::DeleteFile),
            CMD_REPLICATION_INFO => Some(Self::ReplicationInfo),
            _ => None,
        }
    }

    pub fn as_wire(&self) -> &'static str {
        match self {
            Self::List => CMD_LIST,
            Self::Upload => CMD_UPLOAD,
            Self::Download => CMD_DOWNLOAD,
            Self::DeleteFile => CMD_DELETE_FILE,
            Self::ReplicationInfo => CMD_REPLICATION_INFO,
        }
    }
}

/// Commands accepted on a storage node's port (one per connection).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageCommand {
    Store,
    GetPart,
    DeletePart,
}

impl StorageCommand {
    pub fn from_wire(command: &str) -> Option<Self> {
        match command {
            CMD_STORE => Some(Self::Store),
            CMD_GET_PART => Some(Self::GetPart),
            CMD_DELETE_PART => Some(Self::DeletePart),
            _ => None,
        }
    }

    pub fn as_wire(&self) -> &'static str {
        match self {
            Self::Store => CMD_STORE,
            Self::GetPart => CMD_GET_PART,
            Self::DeletePart => CMD_DELETE_PART,
        }
    }
}
