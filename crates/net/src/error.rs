/// Per-packet failures. These never outlive the packet that caused them:
/// the engine turns each one into a drop verdict.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error("allocation failed while resizing packet")]
    OutOfMemory,

    #[error("packet of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },

    #[error("malformed packet: {0}")]
    Malformed(&'static str),

    #[error("match at offset {offset} (+{len}) lies outside {payload_len} byte payload")]
    MatchOutOfRange {
        offset: usize,
        len: usize,
        payload_len: usize,
    },

    #[error("not a TCP segment")]
    NotTcp,

    #[error("not a UDP datagram")]
    NotUdp,
}

/// The companion connection-tracking module could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("companion module '{0}' not found")]
pub struct NotFound(pub String);

/// Administrative failures reported to whoever registers helpers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("a helper matching the pattern of '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("helper '{helper}' depends on an unavailable module: {source}")]
    DependencyUnavailable {
        helper: String,
        #[source]
        source: NotFound,
    },
}

/// `EEXIST`, returned when a helper pattern collides.
pub const EEXIST: i32 = 17;
/// `EBUSY`, returned when the companion module cannot be pinned.
pub const EBUSY: i32 = 16;

impl RegistryError {
    /// Negative errno-style status for module-facing callers.
    pub fn status_code(&self) -> i32 {
        match self {
            RegistryError::AlreadyRegistered(_) => -EEXIST,
            RegistryError::DependencyUnavailable { .. } => -EBUSY,
        }
    }
}

/// Collapse a registration result into `0` or a negative status code.
pub fn status_code(result: &Result<(), RegistryError>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => e.status_code(),
    }
}

impl From<RegistryError> for natmangle_core::Error {
    fn from(err: RegistryError) -> Self {
        natmangle_core::Error::Registry(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn too_large_display() {
        let err = PacketError::TooLarge {
            len: 65540,
            max: 65535,
        };
        assert_eq!(
            err.to_string(),
            "packet of 65540 bytes exceeds the 65535 byte limit"
        );
    }

    #[test]
    fn status_codes() {
        assert_eq!(status_code(&Ok(())), 0);
        assert_eq!(
            status_code(&Err(RegistryError::AlreadyRegistered("ftp".into()))),
            -17
        );
        let err = RegistryError::DependencyUnavailable {
            helper: "ftp".into(),
            source: NotFound("ftp".into()),
        };
        assert_eq!(err.status_code(), -16);
    }

    #[test]
    fn dependency_error_keeps_source() {
        use std::error::Error as _;

        let err = RegistryError::DependencyUnavailable {
            helper: "irc".into(),
            source: NotFound("conntrack-irc".into()),
        };
        let source = err.source().map(|s| s.to_string());
        assert_eq!(
            source.as_deref(),
            Some("companion module 'conntrack-irc' not found")
        );
    }

    #[test]
    fn converts_into_core_error() {
        let err: natmangle_core::Error = RegistryError::AlreadyRegistered("ftp".into()).into();
        assert!(matches!(err, natmangle_core::Error::Registry(_)));
        assert!(err.to_string().contains("ftp"));
    }
}
