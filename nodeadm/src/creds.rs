//! Selection of the credential bootstrap mechanism.
//!
//! A hybrid node authenticates either as an SSM managed instance or through
//! IAM Roles Anywhere with an X.509 certificate. The two are mutually
//! exclusive.
use std::fmt;
use std::str::FromStr;

use hybrid_api::node_config::NodeConfig;

use crate::system::os::{OsFamily, OsInfo};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CredentialProvider {
    Ssm,
    IamRolesAnywhere,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CredentialProviderError {
    #[error("no credential provider configured: set either spec.hybrid.ssm or spec.hybrid.iamRolesAnywhere")]
    NoneConfigured,
    #[error("both spec.hybrid.ssm and spec.hybrid.iamRolesAnywhere are set, only one credential provider is allowed")]
    BothConfigured,
    #[error("invalid credential provider {0:?}, expected ssm or iam-ra")]
    Invalid(String),
    #[error("credential provider {provider} is not supported on {os}")]
    Unsupported { provider: CredentialProvider, os: String },
}

impl FromStr for CredentialProvider {
    type Err = CredentialProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ssm" => Ok(CredentialProvider::Ssm),
            "iam-ra" => Ok(CredentialProvider::IamRolesAnywhere),
            other => Err(CredentialProviderError::Invalid(other.to_string())),
        }
    }
}

impl fmt::Display for CredentialProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CredentialProvider::Ssm => "ssm",
            CredentialProvider::IamRolesAnywhere => "iam-ra",
        })
    }
}

pub fn get_credential_provider_from_node_config(
    config: &NodeConfig,
) -> Result<CredentialProvider, CredentialProviderError> {
    match (config.is_ssm(), config.is_iam_roles_anywhere()) {
        (true, false) => Ok(CredentialProvider::Ssm),
        (false, true) => Ok(CredentialProvider::IamRolesAnywhere),
        (true, true) => Err(CredentialProviderError::BothConfigured),
        (false, false) => Err(CredentialProviderError::NoneConfigured),
    }
}

/// Rejects OS and provider combinations known not to work. The RHEL 8 FIPS
/// crypto module is incompatible with the IAM Roles Anywhere signing helper.
pub fn validate_credential_provider(
    provider: CredentialProvider,
    os: &OsInfo,
) -> Result<(), CredentialProviderError> {
    let unsupported = matches!(
        (provider, os.family, os.major_version()),
        (
            CredentialProvider::IamRolesAnywhere,
            OsFamily::Rhel | OsFamily::Rocky,
            Some(8)
        )
    );
    if unsupported {
        return Err(CredentialProviderError::Unsupported {
            provider,
            os: os.to_string(),
        });
    }
    Ok(())
}
