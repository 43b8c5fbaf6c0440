//! Bootstrap token issuance for nodes joining an existing control plane.
//!
//! Tokens use the kubeadm format `[a-z0-9]{6}.[a-z0-9]{16}`. The issuer
//! stores each token as a `bootstrap.kubernetes.io/token` secret in the
//! workload cluster's `kube-system` namespace with an expiration, so the
//! cluster itself enforces the TTL.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rand::Rng;
use thiserror::Error;
use tracing::{debug, info};

/// Namespace bootstrap token secrets live in.
pub const TOKEN_NAMESPACE: &str = "kube-system";

/// Secret type recognized by the bootstrap authenticator.
pub const TOKEN_SECRET_TYPE: &str = "bootstrap.kubernetes.io/token";

/// Group joining nodes are placed in.
pub const DEFAULT_NODE_GROUP: &str = "system:bootstrappers:kubeadm:default-node-token";

const TOKEN_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const TOKEN_ID_LEN: usize = 6;
const TOKEN_SECRET_LEN: usize = 16;

/// Token issuance errors.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("failed to connect to control plane at {endpoint}: {message}")]
    Connect { endpoint: String, message: String },

    #[error("failed to create secret {namespace}/{name}: {message}")]
    CreateSecret {
        namespace: String,
        name: String,
        message: String,
    },

    #[error("invalid token TTL {0:?}")]
    InvalidTtl(Duration),
}

/// Opaque, time-bounded join credential.
#[derive(Clone, PartialEq, Eq)]
pub struct BootstrapToken {
    id: String,
    secret: String,
}

impl BootstrapToken {
    /// Generate a random token.
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        Self {
            id: random_string(&mut rng, TOKEN_ID_LEN),
            secret: random_string(&mut rng, TOKEN_SECRET_LEN),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Full `id.secret` form handed to the joining node.
    pub fn expose(&self) -> String {
        format!("{}.{}", self.id, self.secret)
    }

    /// Name of the secret storing this token.
    pub fn secret_name(&self) -> String {
        format!("bootstrap-token-{}", self.id)
    }
}

impl fmt::Debug for BootstrapToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootstrapToken")
            .field("id", &self.id)
            .field("secret", &"<redacted>")
            .finish()
    }
}

fn random_string(rng: &mut impl Rng, len: usize) -> String {
    (0..len)
        .map(|_| TOKEN_ALPHABET[rng.random_range(0..TOKEN_ALPHABET.len())] as char)
        .collect()
}

/// Secret as written to the workload cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSecret {
    pub namespace: String,
    pub name: String,
    pub secret_type: String,
    pub data: BTreeMap<String, String>,
}

impl TokenSecret {
    pub fn for_token(token: &BootstrapToken, expires_at: DateTime<Utc>) -> Self {
        let data = [
            ("token-id", token.id.clone()),
            ("token-secret", token.secret.clone()),
            (
                "expiration",
                expires_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            ),
            ("usage-bootstrap-authentication", "true".to_string()),
            ("usage-bootstrap-signing", "true".to_string()),
            ("auth-extra-groups", DEFAULT_NODE_GROUP.to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Self {
            namespace: TOKEN_NAMESPACE.to_string(),
            name: token.secret_name(),
            secret_type: TOKEN_SECRET_TYPE.to_string(),
            data,
        }
    }
}

/// Secret API of a workload cluster.
#[async_trait]
pub trait SecretClient: Send + Sync {
    async fn create_secret(&self, secret: &TokenSecret) -> Result<(), TokenError>;
}

/// Connects to a workload cluster given its endpoint and kubeconfig.
#[async_trait]
pub trait SecretClientFactory: Send + Sync {
    async fn connect(
        &self,
        endpoint: &str,
        kubeconfig: &str,
    ) -> Result<Arc<dyn SecretClient>, TokenError>;
}

/// Issues bootstrap tokens for joining nodes.
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    async fn issue(
        &self,
        endpoint: &str,
        kubeconfig: &str,
        ttl: Duration,
    ) -> Result<BootstrapToken, TokenError>;
}

/// Issuer writing kubeadm bootstrap token secrets.
pub struct KubeadmTokenIssuer {
    clients: Arc<dyn SecretClientFactory>,
}

impl KubeadmTokenIssuer {
    pub fn new(clients: Arc<dyn SecretClientFactory>) -> Self {
        Self { clients }
    }
}

#[async_trait]
impl TokenIssuer for KubeadmTokenIssuer {
    async fn issue(
        &self,
        endpoint: &str,
        kubeconfig: &str,
        ttl: Duration,
    ) -> Result<BootstrapToken, TokenError> {
        let ttl_chrono = chrono::Duration::from_std(ttl).map_err(|_| TokenError::InvalidTtl(ttl))?;
        if ttl.is_zero() {
            return Err(TokenError::InvalidTtl(ttl));
        }

        debug!(endpoint, "Connecting to workload cluster");
        let client = self.clients.connect(endpoint, kubeconfig).await?;

        let token = BootstrapToken::generate();
        let secret = TokenSecret::for_token(&token, Utc::now() + ttl_chrono);
        client.create_secret(&secret).await?;

        info!(
            token_id = token.id(),
            ttl_secs = ttl.as_secs(),
            "Issued bootstrap token"
        );
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemorySecretClientFactory;

    #[test]
    fn test_token_format() {
        let token = BootstrapToken::generate();
        let exposed = token.expose();
        let (id, secret) = exposed.split_once('.').unwrap();

        assert_eq!(id.len(), 6);
        assert_eq!(secret.len(), 16);
        assert!(exposed
            .chars()
            .all(|c| c == '.' || c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let token = BootstrapToken::generate();
        let rendered = format!("{token:?}");
        assert!(!rendered.contains(&token.secret));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_secret_layout() {
        let token = BootstrapToken::generate();
        let expires = DateTime::parse_from_rfc3339("2026-01-01T00:10:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let secret = TokenSecret::for_token(&token, expires);

        assert_eq!(secret.namespace, "kube-system");
        assert_eq!(secret.name, format!("bootstrap-token-{}", token.id()));
        assert_eq!(secret.secret_type, TOKEN_SECRET_TYPE);
        assert_eq!(secret.data["expiration"], "2026-01-01T00:10:00Z");
        assert_eq!(secret.data["token-id"], token.id());
    }

    #[tokio::test]
    async fn test_issue_writes_secret_with_ttl() {
        let factory = Arc::new(MemorySecretClientFactory::new());
        let issuer = KubeadmTokenIssuer::new(factory.clone());

        let before = Utc::now();
        let token = issuer
            .issue("https://cp.example:6443", "kubeconfig", Duration::from_secs(600))
            .await
            .unwrap();

        let secrets = factory.secrets();
        assert_eq!(secrets.len(), 1);
        assert_eq!(secrets[0].name, token.secret_name());

        let expiration = DateTime::parse_from_rfc3339(&secrets[0].data["expiration"])
            .unwrap()
            .with_timezone(&Utc);
        let ttl = expiration - before;
        assert!(ttl >= chrono::Duration::seconds(599));
        assert!(ttl <= chrono::Duration::seconds(601));
    }

    #[tokio::test]
    async fn test_issue_propagates_connect_failure() {
        let factory = Arc::new(MemorySecretClientFactory::new());
        factory.fail_connect(true);
        let issuer = KubeadmTokenIssuer::new(factory.clone());

        let result = issuer
            .issue("https://cp.example:6443", "kubeconfig", Duration::from_secs(600))
            .await;

        assert!(matches!(result, Err(TokenError::Connect { .. })));
        assert!(factory.secrets().is_empty());
    }

    #[tokio::test]
    async fn test_issue_rejects_zero_ttl() {
        let issuer = KubeadmTokenIssuer::new(Arc::new(MemorySecretClientFactory::new()));
        let result = issuer.issue("e", "k", Duration::ZERO).await;
        assert!(matches!(result, Err(TokenError::InvalidTtl(_))));
    }
}
