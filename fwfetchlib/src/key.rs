use std::{
    fmt,
    path::Path,
};

use log::debug;
use thiserror::Error;

use crate::{
    crypto,
    error::Error,
    identifier::FwVersion,
};

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("File name has no known encryption suffix: {0}")]
    UnsupportedScheme(String),
    #[error("Metadata for V4 encrypted file has no logic value")]
    MissingLogicValue,
    #[error("Logic value is not exactly 16 bytes: {0:?}")]
    InvalidLogicValue(String),
}

impl From<KeyError> for Error {
    fn from(e: KeyError) -> Self {
        match e {
            KeyError::UnsupportedScheme(name) => Self::UnsupportedScheme(name),
            e => Self::Protocol(e.into()),
        }
    }
}

/// Firmware key derivation convention, selected by the encrypted file's
/// extension.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum KeyScheme {
    /// `.enc2`: key is derived from the identifier alone
    V2,
    /// `.enc4`: key is derived from the version and a server-provided seed
    V4,
}

impl KeyScheme {
    pub fn from_file_name(file_name: &str) -> Option<Self> {
        match Path::new(file_name).extension().and_then(|e| e.to_str()) {
            Some("enc2") => Some(Self::V2),
            Some("enc4") => Some(Self::V4),
            _ => None,
        }
    }
}

impl fmt::Display for KeyScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V2 => f.write_str("V2"),
            Self::V4 => f.write_str("V4"),
        }
    }
}

/// AES-128 key for one decryption pass.
#[derive(Clone, Eq, PartialEq)]
pub struct DecryptionKey {
    pub bytes: [u8; 16],
    pub scheme: KeyScheme,
}

impl fmt::Debug for DecryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecryptionKey")
            .field("bytes", &"<redacted>")
            .field("scheme", &self.scheme)
            .finish()
    }
}

/// Compute the decryption key for an encrypted firmware file. This is a pure
/// function of its inputs. `version` should be the server-normalized version
/// and `logic_value` is only consulted for V4 files.
pub fn derive_key(
    file_name: &str,
    version: &FwVersion,
    model: &str,
    region: &str,
    logic_value: Option<&str>,
) -> Result<DecryptionKey, KeyError> {
    let scheme = KeyScheme::from_file_name(file_name)
        .ok_or_else(|| KeyError::UnsupportedScheme(file_name.to_owned()))?;

    let material = match scheme {
        KeyScheme::V2 => format!("{region}:{model}:{version}"),
        KeyScheme::V4 => {
            let seed = logic_value.ok_or(KeyError::MissingLogicValue)?;
            if seed.len() != 16 {
                return Err(KeyError::InvalidLogicValue(seed.to_owned()));
            }

            crypto::logic_check(seed.as_bytes(), version.to_string().as_bytes())
        }
    };

    debug!("Derived {scheme} key for {file_name:?}");

    Ok(DecryptionKey {
        bytes: md5::compute(material.as_bytes()).into(),
        scheme,
    })
}
