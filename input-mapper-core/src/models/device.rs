use serde::{Deserialize, Serialize};

/// Identifies the selected input device and the format it captures in.
///
/// Replaced wholesale on reconstruction, never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub id: String,
    pub name: String,
    pub sample_rate: u32,
    pub channels: u16,
}

impl DeviceDescriptor {
    pub fn new(id: impl Into<String>, name: impl Into<String>, sample_rate: u32, channels: u16) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            sample_rate,
            channels,
        }
    }
}

impl std::fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}] {} Hz/{} ch",
            self.name, self.id, self.sample_rate, self.channels
        )
    }
}
