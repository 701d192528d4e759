//! Root certificate status for TLS interception.
//!
//! Certificate generation and trust-store installation belong to the
//! platform; the control plane only asks whether interception can work.

use crate::config::CertificateConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateInfo {
    pub fingerprint: String,
    pub not_after: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateStatus {
    pub installed: bool,
    pub fingerprint: Option<String>,
    pub not_after: Option<DateTime<Utc>>,
    pub trusted: bool,
    pub expired: bool,
}

impl CertificateStatus {
    pub fn missing() -> Self {
        Self {
            installed: false,
            fingerprint: None,
            not_after: None,
            trusted: false,
            expired: false,
        }
    }

    /// TLS interception needs an installed, trusted, unexpired root.
    pub fn usable(&self) -> bool {
        self.installed && self.trusted && !self.expired
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CertificateProvider: Send + Sync {
    async fn root_certificate(&self) -> Option<CertificateInfo>;

    async fn is_trusted(&self) -> bool;
}

pub async fn status_of(provider: &dyn CertificateProvider) -> CertificateStatus {
    match provider.root_certificate().await {
        Some(info) => CertificateStatus {
            installed: true,
            expired: info.not_after <= Utc::now(),
            trusted: provider.is_trusted().await,
            fingerprint: Some(info.fingerprint),
            not_after: Some(info.not_after),
        },
        None => CertificateStatus::missing(),
    }
}

/// Certificate details supplied through configuration.
pub struct StaticCertificate {
    config: Option<CertificateConfig>,
}

impl StaticCertificate {
    pub fn new(config: Option<CertificateConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl CertificateProvider for StaticCertificate {
    async fn root_certificate(&self) -> Option<CertificateInfo> {
        self.config.as_ref().map(|c| CertificateInfo {
            fingerprint: c.fingerprint.clone(),
            not_after: c.not_after,
        })
    }

    async fn is_trusted(&self) -> bool {
        self.config.as_ref().is_some_and(|c| c.trusted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_status_from_mock_provider() {
        let mut provider = MockCertificateProvider::new();
        provider.expect_root_certificate().returning(|| {
            Some(CertificateInfo {
                fingerprint: "AB:CD".to_string(),
                not_after: Utc::now() - Duration::days(1),
            })
        });
        provider.expect_is_trusted().returning(|| true);

        let status = status_of(&provider).await;
        assert!(status.installed);
        assert!(status.trusted);
        assert!(status.expired);
        assert!(!status.usable());
    }

    #[tokio::test]
    async fn test_missing_certificate_skips_trust_check() {
        let mut provider = MockCertificateProvider::new();
        provider.expect_root_certificate().returning(|| None);
        provider.expect_is_trusted().never();

        assert_eq!(status_of(&provider).await, CertificateStatus::missing());
    }

    #[tokio::test]
    async fn test_static_certificate() {
        let provider = StaticCertificate::new(Some(CertificateConfig {
            fingerprint: "01:02".to_string(),
            not_after: Utc::now() + Duration::days(30),
            trusted: true,
        }));
        assert!(status_of(&provider).await.usable());

        let provider = StaticCertificate::new(None);
        assert!(!status_of(&provider).await.installed);
    }
}
