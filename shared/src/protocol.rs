//! Guacamole protocol types.
//!
//! An instruction is an opcode followed by zero or more arguments. On the
//! wire every element is prefixed by its length in Unicode codepoints:
//! `4.size,1.0,4.1024,3.768;`

use std::fmt;

/// Opcode reserved for tunnel-internal instructions. Never forwarded to guacd.
pub const INTERNAL_DATA_OPCODE: &str = "";

/// Sub-command of an internal instruction testing connection stability.
pub const PING_OPCODE: &str = "ping";

/// Marks the end of one HTTP tunnel read response.
pub const END_OF_INSTRUCTIONS: &str = "0.;";

/// A single protocol instruction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Instruction {
    opcode: String,
    args: Vec<String>,
}

impl Instruction {
    pub fn new(opcode: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            opcode: opcode.into(),
            args,
        }
    }

    /// Build an instruction from its elements, opcode first.
    /// Returns `None` if there are no elements.
    pub fn from_elements(mut elements: Vec<String>) -> Option<Self> {
        if elements.is_empty() {
            return None;
        }
        let opcode = elements.remove(0);
        Some(Self {
            opcode,
            args: elements,
        })
    }

    /// Build a tunnel-internal instruction.
    pub fn internal(args: Vec<String>) -> Self {
        Self::new(INTERNAL_DATA_OPCODE, args)
    }

    /// The `error` instruction reporting a failure to the client.
    pub fn error(message: &str, status: crate::Status) -> Self {
        Self::new(
            "error",
            vec![message.to_string(), status.guacamole_code().to_string()],
        )
    }

    pub fn opcode(&self) -> &str {
        &self.opcode
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn is_internal(&self) -> bool {
        self.opcode == INTERNAL_DATA_OPCODE
    }

    pub fn elements(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.opcode.as_str()).chain(self.args.iter().map(String::as_str))
    }

    /// Serialize to wire format.
    pub fn encode(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, element) in self.elements().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}.{}", element.chars().count(), element)?;
        }
        f.write_str(";")
    }
}

/// Protocol versions understood by the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProtocolVersion {
    V1_0_0,
    V1_1_0,
}

/// Optional protocol features gated on the negotiated version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// The client timezone may be sent during the handshake.
    TimezoneHandshake,
}

impl ProtocolVersion {
    pub const LATEST: ProtocolVersion = ProtocolVersion::V1_1_0;

    fn triple(self) -> (u32, u32, u32) {
        match self {
            ProtocolVersion::V1_0_0 => (1, 0, 0),
            ProtocolVersion::V1_1_0 => (1, 1, 0),
        }
    }

    /// Parse `VERSION_X_Y_Z`. Strings that look like a version but are not
    /// known map to 1.0.0; anything else is not a version at all.
    pub fn parse(s: &str) -> Option<Self> {
        let rest = s.strip_prefix("VERSION_")?;
        let parts: Vec<&str> = rest.split('_').collect();
        match parts.as_slice() {
            ["1", "1", "0"] => Some(ProtocolVersion::V1_1_0),
            _ => Some(ProtocolVersion::V1_0_0),
        }
    }

    pub fn at_least(self, other: ProtocolVersion) -> bool {
        self.triple() >= other.triple()
    }

    pub fn supports(self, capability: Capability) -> bool {
        match capability {
            Capability::TimezoneHandshake => self.at_least(ProtocolVersion::V1_1_0),
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (major, minor, patch) = self.triple();
        write!(f, "VERSION_{}_{}_{}", major, minor, patch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode() {
        let inst = Instruction::new(
            "test2",
            vec!["hellohello".into(), "worldworldworld".into()],
        );
        assert_eq!(inst.encode(), "5.test2,10.hellohello,15.worldworldworld;");
    }

    #[test]
    fn test_encode_empty_instruction() {
        assert_eq!(Instruction::internal(vec![]).encode(), END_OF_INSTRUCTIONS);
    }

    #[test]
    fn test_encode_counts_codepoints() {
        let inst = Instruction::new("a\u{72AC}\u{10B00}z\u{C1}b", vec![]);
        assert_eq!(inst.encode(), "6.a\u{72AC}\u{10B00}z\u{C1}b;");
    }

    #[test]
    fn test_error_instruction() {
        let inst = Instruction::error("Aborted.", crate::Status::UpstreamError);
        assert_eq!(inst.encode(), "5.error,8.Aborted.,3.515;");
    }

    #[test]
    fn test_version_parse() {
        assert_eq!(ProtocolVersion::parse("VERSION_1_1_0"), Some(ProtocolVersion::V1_1_0));
        assert_eq!(ProtocolVersion::parse("VERSION_1_5_0"), Some(ProtocolVersion::V1_0_0));
        assert_eq!(ProtocolVersion::parse("hostname"), None);
        assert_eq!(ProtocolVersion::V1_1_0.to_string(), "VERSION_1_1_0");
    }

    #[test]
    fn test_capabilities() {
        assert!(ProtocolVersion::V1_1_0.supports(Capability::TimezoneHandshake));
        assert!(!ProtocolVersion::V1_0_0.supports(Capability::TimezoneHandshake));
        assert!(ProtocolVersion::LATEST.at_least(ProtocolVersion::V1_0_0));
    }
}
