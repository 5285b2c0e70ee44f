use std::{fmt, str::FromStr};
use thiserror::Error;
use uuid::Uuid;

use crate::error::TunnelError;
use crate::protocol::CREDENTIAL_LEN;

/// Length of the hyphenated `8-4-4-4-12` text form.
const CANONICAL_LEN: usize = 36;

#[derive(Debug, Error)]
pub enum CredentialParseError {
    #[error("credential must be in hyphenated 8-4-4-4-12 form, got {0} characters")]
    NotCanonical(usize),

    #[error("invalid credential: {0}")]
    Invalid(#[from] uuid::Error),
}

/// The 128-bit secret every handshake must present.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Credential([u8; CREDENTIAL_LEN]);

impl Credential {
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; CREDENTIAL_LEN] {
        &self.0
    }

    /// Byte-exact comparison against the credential decoded from a handshake.
    pub fn verify(&self, presented: &[u8; CREDENTIAL_LEN]) -> Result<(), TunnelError> {
        if self.0 == *presented {
            Ok(())
        } else {
            Err(TunnelError::Auth)
        }
    }
}

impl FromStr for Credential {
    type Err = CredentialParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        // uuid also accepts simple, braced and URN forms; only the hyphenated one is allowed here.
        if s.len() != CANONICAL_LEN {
            return Err(CredentialParseError::NotCanonical(s.len()));
        }
        let uuid = Uuid::try_parse(s)?;
        Ok(Self(*uuid.as_bytes()))
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Uuid::from_bytes(self.0).hyphenated())
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}
