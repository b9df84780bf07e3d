//! Common type definitions

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Payload carried by a block.
///
/// The ledger never looks inside a record; it only needs to serialize it
/// (for the wire and for fingerprinting) and to build an empty one for the
/// genesis block.
pub trait Record:
    Serialize + DeserializeOwned + Default + Clone + fmt::Debug + PartialEq + Send + Sync + 'static
{
}

impl<T> Record for T where
    T: Serialize + DeserializeOwned + Default + Clone + fmt::Debug + PartialEq + Send + Sync + 'static
{
}

/// A single medical-record entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MedicalRecord {
    pub name: String,
    pub year: String,
    pub hospital: String,
    pub doctor: String,
    pub diagnostic: String,
    pub medication: String,
    pub procedure: String,
}

impl MedicalRecord {
    /// Field labels paired with their values, in entry order
    pub fn fields(&self) -> [(&'static str, &str); 7] {
        [
            ("Name", self.name.as_str()),
            ("Year", self.year.as_str()),
            ("Hospital", self.hospital.as_str()),
            ("Doctor", self.doctor.as_str()),
            ("Diagnostic", self.diagnostic.as_str()),
            ("Medication", self.medication.as_str()),
            ("Procedure", self.procedure.as_str()),
        ]
    }
}

impl fmt::Display for MedicalRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (label, value) in self.fields() {
            writeln!(f, "\t{}: {}", label, value)?;
        }
        Ok(())
    }
}

/// Where a node is in the join handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JoinState {
    /// Not synchronised with any network
    Uninitialized,
    /// NEW_HOST sent, waiting for the membership snapshot
    AwaitingMembership,
    /// Membership known, waiting for SET_BLOCKS
    AwaitingChain,
    /// Chain synchronised (or first node); records may be appended
    Ready,
}

impl fmt::Display for JoinState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinState::Uninitialized => write!(f, "UNINITIALIZED"),
            JoinState::AwaitingMembership => write!(f, "AWAITING_MEMBERSHIP"),
            JoinState::AwaitingChain => write!(f, "AWAITING_CHAIN"),
            JoinState::Ready => write!(f, "READY"),
        }
    }
}
