use std::fmt;

use rand::RngCore;

use crate::error::RequestError;

const SESSION_ID_BYTES: usize = 16;
const SESSION_ID_HEX_LEN: usize = SESSION_ID_BYTES * 2;

/// A 128-bit session identifier, rendered as 32 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId([u8; SESSION_ID_BYTES]);

impl SessionId {
    /// Draws a fresh identifier from the OS entropy source.
    pub fn generate() -> Self {
        let mut bytes = [0u8; SESSION_ID_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Parses the `SID` query parameter. The empty string is the "no session
    /// yet" sentinel and maps to `None`; anything that is not 32 hex chars
    /// is rejected.
    pub fn parse(s: &str) -> Result<Option<Self>, RequestError> {
        if s.is_empty() {
            return Ok(None);
        }
        if s.len() != SESSION_ID_HEX_LEN {
            return Err(RequestError::malformed("SID has wrong length"));
        }
        let mut bytes = [0u8; SESSION_ID_BYTES];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|_| RequestError::malformed("SID is not hex"))?;
        Ok(Some(Self(bytes)))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self)
    }
}
