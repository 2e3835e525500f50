//! Registry credentials and the token handshake.

use anyhow::{Context, Result};
use base64::Engine as _;
use serde::Deserialize;

/// A resolved credential for one registry.
#[derive(Debug, Clone)]
pub enum Credential {
    /// No credential; try anonymous access.
    Anonymous,
    /// HTTP basic auth.
    Basic {
        /// User name.
        username: String,
        /// Password or token secret.
        password: String,
    },
}

impl Credential {
    /// The value of an `Authorization: Basic ...` header, if any.
    pub fn basic_header(&self) -> Option<String> {
        match self {
            Credential::Anonymous => None,
            Credential::Basic { username, password } => {
                let encoded = base64::engine::general_purpose::STANDARD
                    .encode(format!("{username}:{password}"));
                Some(format!("Basic {encoded}"))
            }
        }
    }
}

/// Output of a `docker-credential-*` style helper.
#[derive(Debug, Deserialize)]
struct HelperOutput {
    #[serde(rename = "Username")]
    username: String,
    #[serde(rename = "Secret")]
    secret: String,
}

/// Run an external credential helper (`<helper> get` with the registry
/// on stdin, JSON on stdout).
async fn run_credential_helper(helper: &str, registry: &str) -> Result<Credential> {
    use tokio::io::AsyncWriteExt;

    let mut child = tokio::process::Command::new(helper)
        .arg("get")
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::null())
        .spawn()
        .with_context(|| format!("Spawning credential helper {helper}"))?;
    child
        .stdin
        .take()
        .context("Credential helper stdin")?
        .write_all(registry.as_bytes())
        .await?;
    let output = child
        .wait_with_output()
        .await
        .with_context(|| format!("Running credential helper {helper}"))?;
    anyhow::ensure!(
        output.status.success(),
        "Credential helper {helper} failed for {registry}"
    );
    let parsed: HelperOutput = serde_json::from_slice(&output.stdout)
        .with_context(|| format!("Parsing credential helper output for {registry}"))?;
    Ok(Credential::Basic {
        username: parsed.username,
        password: parsed.secret,
    })
}

/// Resolve the credential for a registry: the `IMG_CREDENTIAL_HELPER`
/// override first, then the Docker credential store, then anonymous.
pub async fn credential_for(registry: &str) -> Credential {
    if let Ok(helper) = std::env::var("IMG_CREDENTIAL_HELPER") {
        match run_credential_helper(&helper, registry).await {
            Ok(c) => return c,
            Err(e) => {
                tracing::warn!("Credential helper failed for {registry}: {e:#}");
            }
        }
    }
    let server = registry.to_string();
    let lookup = tokio::task::spawn_blocking(move || {
        docker_credential::get_credential(&server)
    })
    .await;
    match lookup {
        Ok(Ok(docker_credential::DockerCredential::UsernamePassword(username, password))) => {
            Credential::Basic { username, password }
        }
        Ok(Ok(docker_credential::DockerCredential::IdentityToken(_))) => {
            tracing::debug!("Identity tokens are not supported; using anonymous auth");
            Credential::Anonymous
        }
        _ => Credential::Anonymous,
    }
}

/// A parsed `WWW-Authenticate: Bearer ...` challenge.
#[derive(Debug, PartialEq, Eq)]
pub struct BearerChallenge {
    /// The token endpoint.
    pub realm: String,
    /// The `service` parameter, if present.
    pub service: Option<String>,
}

/// Parse a bearer challenge header value. Returns `None` for `Basic`
/// and other schemes.
pub fn parse_bearer_challenge(header: &str) -> Option<BearerChallenge> {
    let params = header.strip_prefix("Bearer ")?;
    let mut realm = None;
    let mut service = None;
    for part in params.split(',') {
        let (key, value) = part.trim().split_once('=')?;
        let value = value.trim_matches('"');
        match key {
            "realm" => realm = Some(value.to_string()),
            "service" => service = Some(value.to_string()),
            _ => {}
        }
    }
    Some(BearerChallenge {
        realm: realm?,
        service,
    })
}
