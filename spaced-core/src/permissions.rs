//! App tokens, path grants and caller identity.
//!
//! An app token is stored JSON-encoded in the [`SecretStore`] under
//! `appToken_<key>`. Clients present it as an access token `<key>.<secret>`.
//! Each permission string grants `read:<prefix>` or `write:<prefix>`; write
//! implies read. A master token grants everything.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{AuthError, SecretStoreError};
use crate::secrets::SecretStore;

pub const APP_TOKEN_STORE_KEY: &str = "appToken";
pub const MASTER_APP_TOKEN_STORE_KEY: &str = "masterAppToken";

const TOKEN_KEY_LENGTH: usize = 20;
const TOKEN_SECRET_LENGTH: usize = 30;

/// What a caller wants to do with a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    Read,
    Write,
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Access::Read => write!(f, "read"),
            Access::Write => write!(f, "write"),
        }
    }
}

/// One `access:prefix` permission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub access: Access,
    pub prefix: PathBuf,
}

impl Grant {
    pub fn allows(&self, access: Access, path: &Path) -> bool {
        let access_ok = self.access == Access::Write || access == Access::Read;
        access_ok && path.starts_with(&self.prefix)
    }
}

impl FromStr for Grant {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (access, prefix) = s
            .split_once(':')
            .ok_or_else(|| AuthError::UnknownGrant(s.to_string()))?;
        let access = match access {
            "read" => Access::Read,
            "write" => Access::Write,
            _ => return Err(AuthError::UnknownGrant(s.to_string())),
        };
        let prefix = crate::types::normalize_path(Path::new(prefix))
            .ok_or_else(|| AuthError::UnknownGrant(s.to_string()))?;
        Ok(Self { access, prefix })
    }
}

impl fmt::Display for Grant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.access, self.prefix.display())
    }
}

/// Identity attached to every data source request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    /// No credentials; allowed nothing.
    Anonymous,
    /// The master app token; allowed everything.
    Master,
    App { key: String, grants: Vec<Grant> },
}

impl Caller {
    pub fn allows(&self, access: Access, path: &Path) -> bool {
        match self {
            Caller::Anonymous => false,
            Caller::Master => true,
            Caller::App { grants, .. } => grants.iter().any(|g| g.allows(access, path)),
        }
    }
}

/// Stored form of an app token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppToken {
    pub key: String,
    pub secret: String,
    #[serde(rename = "isMaster")]
    pub is_master: bool,
    #[serde(default)]
    pub permissions: Vec<String>,
}

impl AppToken {
    /// Fresh random key and secret.
    pub fn generate(is_master: bool, permissions: Vec<String>) -> Self {
        let mut rng = rand::rng();
        let mut key = [0u8; TOKEN_KEY_LENGTH];
        let mut secret = [0u8; TOKEN_SECRET_LENGTH];
        rng.fill_bytes(&mut key);
        rng.fill_bytes(&mut secret);
        Self {
            key: URL_SAFE_NO_PAD.encode(key),
            secret: URL_SAFE_NO_PAD.encode(secret),
            is_master,
            permissions,
        }
    }

    pub fn access_token(&self) -> String {
        format!("{}.{}", self.key, self.secret)
    }

    pub fn grants(&self) -> Result<Vec<Grant>, AuthError> {
        self.permissions.iter().map(|p| p.parse()).collect()
    }
}

/// Split `<key>.<secret>`.
pub fn split_access_token(access_token: &str) -> Result<(&str, &str), AuthError> {
    match access_token.split_once('.') {
        Some((key, secret)) if !key.is_empty() && !secret.is_empty() => Ok((key, secret)),
        _ => Err(AuthError::MalformedToken),
    }
}

fn store_key(token_key: &str) -> String {
    format!("{APP_TOKEN_STORE_KEY}_{token_key}")
}

fn master_store_key() -> String {
    format!("{APP_TOKEN_STORE_KEY}_{MASTER_APP_TOKEN_STORE_KEY}")
}

/// Issues, stores and checks app tokens against a [`SecretStore`].
pub struct TokenAuthority<S: SecretStore + ?Sized> {
    store: Arc<S>,
}

impl<S: SecretStore + ?Sized> Clone for TokenAuthority<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: SecretStore + ?Sized> TokenAuthority<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Persist `token`. Refuses to replace an existing master token.
    pub fn store_token(&self, token: &AppToken) -> Result<(), AuthError> {
        token.grants()?;
        if token.is_master {
            match self.store.get(&master_store_key()) {
                Ok(_) => return Err(AuthError::MasterTokenExists),
                Err(SecretStoreError::NotFound { .. }) => {}
                Err(err) => return Err(err.into()),
            }
        }

        let payload = serde_json::to_vec(token)?;
        self.store.set(&store_key(&token.key), &payload)?;
        if token.is_master {
            self.store.set(&master_store_key(), token.key.as_bytes())?;
        }
        tracing::debug!(key = %token.key, master = token.is_master, "stored app token");
        Ok(())
    }

    pub fn load_token(&self, key: &str) -> Result<AppToken, AuthError> {
        let payload = match self.store.get(&store_key(key)) {
            Ok(payload) => payload,
            Err(SecretStoreError::NotFound { .. }) => return Err(AuthError::InvalidToken),
            Err(err) => return Err(err.into()),
        };
        Ok(serde_json::from_slice(&payload)?)
    }

    pub fn revoke(&self, key: &str) -> Result<(), AuthError> {
        let token = self.load_token(key)?;
        self.store.remove(&store_key(key))?;
        if token.is_master {
            self.store.remove(&master_store_key())?;
        }
        Ok(())
    }

    /// Resolve an access token to the caller it identifies.
    pub fn authenticate(&self, access_token: &str) -> Result<Caller, AuthError> {
        let (key, secret) = split_access_token(access_token)?;
        let token = self.load_token(key)?;
        if !constant_time_eq(token.secret.as_bytes(), secret.as_bytes()) {
            return Err(AuthError::InvalidToken);
        }
        if token.is_master {
            return Ok(Caller::Master);
        }
        Ok(Caller::App {
            key: token.key.clone(),
            grants: token.grants()?,
        })
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::MemorySecretStore;

    fn authority() -> TokenAuthority<MemorySecretStore> {
        TokenAuthority::new(Arc::new(MemorySecretStore::new()))
    }

    #[test]
    fn grant_parse_and_display() {
        let grant: Grant = "write:/data/shared".parse().expect("parse");
        assert_eq!(grant.access, Access::Write);
        assert_eq!(grant.to_string(), "write:/data/shared");
        assert!("delete:/data".parse::<Grant>().is_err());
        assert!("read:relative".parse::<Grant>().is_err());
        assert!("/data".parse::<Grant>().is_err());
    }

    #[test]
    fn write_grant_implies_read() {
        let grant: Grant = "write:/data".parse().unwrap();
        assert!(grant.allows(Access::Read, Path::new("/data/a")));
        assert!(grant.allows(Access::Write, Path::new("/data/a")));
        let grant: Grant = "read:/data".parse().unwrap();
        assert!(grant.allows(Access::Read, Path::new("/data/a")));
        assert!(!grant.allows(Access::Write, Path::new("/data/a")));
    }

    #[test]
    fn prefix_matches_whole_components() {
        let grant: Grant = "read:/data".parse().unwrap();
        assert!(!grant.allows(Access::Read, Path::new("/database/x")));
    }

    #[test]
    fn anonymous_is_denied_master_is_allowed() {
        let path = Path::new("/anything");
        assert!(!Caller::Anonymous.allows(Access::Read, path));
        assert!(Caller::Master.allows(Access::Write, path));
    }

    #[test]
    fn authenticate_app_token() {
        let auth = authority();
        let token = AppToken::generate(false, vec!["read:/data".to_string()]);
        auth.store_token(&token).expect("store");

        let caller = auth.authenticate(&token.access_token()).expect("auth");
        assert!(caller.allows(Access::Read, Path::new("/data/f.txt")));
        assert!(!caller.allows(Access::Read, Path::new("/other")));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let auth = authority();
        let token = AppToken::generate(false, vec![]);
        auth.store_token(&token).expect("store");
        let forged = format!("{}.{}", token.key, "not-the-secret");
        assert!(matches!(
            auth.authenticate(&forged),
            Err(AuthError::InvalidToken)
        ));
        assert!(matches!(
            auth.authenticate("no-dot"),
            Err(AuthError::MalformedToken)
        ));
    }

    #[test]
    fn only_one_master_token() {
        let auth = authority();
        let master = AppToken::generate(true, vec![]);
        auth.store_token(&master).expect("first master");
        assert_eq!(
            auth.authenticate(&master.access_token()).unwrap(),
            Caller::Master
        );
        let second = AppToken::generate(true, vec![]);
        assert!(matches!(
            auth.store_token(&second),
            Err(AuthError::MasterTokenExists)
        ));

        auth.revoke(&master.key).expect("revoke");
        auth.store_token(&second).expect("master slot free after revoke");
    }

    #[test]
    fn token_json_uses_is_master_field() {
        let token = AppToken {
            key: "k".into(),
            secret: "s".into(),
            is_master: true,
            permissions: vec![],
        };
        let json = serde_json::to_string(&token).unwrap();
        assert!(json.contains(r#""isMaster":true"#));
    }
}
