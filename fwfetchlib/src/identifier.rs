use std::{
    fmt,
    str::FromStr,
};

use thiserror::Error;

/// The `<pda>/<csc>/<phone>/<data>` firmware version string used by FUS (eg.
/// in the `DEVICE_FW_VERSION` field). Omitted `phone` and `data` components
/// default to the `pda` component, which is also how the service normalizes
/// versions, so [`fmt::Display`] always prints all four.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct FwVersion {
    /// Primary firmware version (`DEVICE_PDA_CODE1_VERSION`)
    pub pda: String,
    /// Carrier services version (`DEVICE_CSC_CODE2_VERSION`)
    pub csc: String,
    /// `DEVICE_PHONE_FONT_VERSION`
    pub phone: String,
    /// `DEVICE_CONTENTS_DATA_VERSION`
    pub data: String,
}

impl FwVersion {
    pub fn new(pda: &str, csc: &str, phone: Option<&str>, data: Option<&str>) -> Self {
        Self {
            pda: pda.to_owned(),
            csc: csc.to_owned(),
            phone: phone.unwrap_or(pda).to_owned(),
            data: data.unwrap_or(pda).to_owned(),
        }
    }
}

impl fmt::Display for FwVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/{}", self.pda, self.csc, self.phone, self.data)
    }
}

impl FromStr for FwVersion {
    type Err = ParseFwVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let pieces: Vec<&str> = s.trim().split('/').collect();

        match pieces.len() {
            0 | 1 => return Err(ParseFwVersionError::TooFewFields),
            2..=4 => {}
            _ => return Err(ParseFwVersionError::TooManyFields),
        }

        if pieces[0].is_empty() || pieces[1].is_empty() {
            return Err(ParseFwVersionError::EmptyField);
        }

        let optional = |i: usize| pieces.get(i).copied().filter(|s| !s.is_empty());

        Ok(Self::new(pieces[0], pieces[1], optional(2), optional(3)))
    }
}

#[derive(Debug, Error)]
pub enum ParseFwVersionError {
    #[error("Too few fields (<2) in version string")]
    TooFewFields,
    #[error("Too many fields (>4) in version string")]
    TooManyFields,
    #[error("PDA and CSC fields must not be empty")]
    EmptyField,
}

/// The device/region/version triple naming one firmware binary. Fixed for the
/// lifetime of a job.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct FirmwareIdentifier {
    /// Device model number (eg. `SM-N986U`)
    pub model: String,
    /// Region/CSC code (eg. `TMB`)
    pub region: String,
    pub firmware_version: FwVersion,
}

impl FirmwareIdentifier {
    pub fn new(model: &str, region: &str, firmware_version: FwVersion) -> Self {
        Self {
            model: model.trim().to_uppercase(),
            region: region.trim().to_uppercase(),
            firmware_version,
        }
    }
}

impl fmt::Display for FirmwareIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}) {}", self.model, self.region, self.firmware_version)
    }
}
