mod memory;
mod types;

pub use memory::MemoryBackend;
#[cfg(test)]
pub use memory::InterleavingBackend;
pub use types::{AccessToken, AuthorizationCode, Client};

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

const CLIENT_TYPE: &str = "client";
const AUTHCODE_TYPE: &str = "authcode";
const ACCESS_TYPE: &str = "access";

/// bytes of randomness behind every secret, code and token (256 bits)
const SECRET_BYTES: usize = 32;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
    #[error("constraint violation: {0}")]
    Conflict(String),
    #[error("malformed document: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for StorageError {
    fn from(e: reqwest::Error) -> Self {
        StorageError::Unavailable(e.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Malformed(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Equality query over documents of one type
#[derive(Debug, Clone)]
pub struct Selector {
    pub doc_type: String,
    pub fields: Vec<(String, String)>,
}

impl Selector {
    pub fn of_type(doc_type: &str) -> Self {
        Self {
            doc_type: doc_type.to_string(),
            fields: Vec::new(),
        }
    }

    pub fn field_eq(mut self, field: &str, value: &str) -> Self {
        self.fields.push((field.to_string(), value.to_string()));
        self
    }

    /// mango selector for couchdb's _find
    pub fn to_mango(&self) -> Value {
        let mut selector = Map::new();
        selector.insert("type".to_string(), json!(self.doc_type));
        for (field, value) in &self.fields {
            selector.insert(field.clone(), json!(value));
        }
        Value::Object(selector)
    }

    pub fn matches(&self, doc: &Value) -> bool {
        doc.get("type").and_then(Value::as_str) == Some(self.doc_type.as_str())
            && self
                .fields
                .iter()
                .all(|(field, value)| doc.get(field).and_then(Value::as_str) == Some(value.as_str()))
    }
}

/// CRUD-by-key plus indexed lookup. Documents come back with `_id` and `_rev` set.
#[async_trait]
pub trait DocumentBackend {
    async fn get(&self, id: &str) -> Result<Option<Value>>;

    /// fails with `StorageError::Conflict` if the id is taken
    async fn insert(&self, id: &str, doc: Value) -> Result<()>;

    /// replace the document if `rev` is still current. false = lost the race (or gone)
    async fn update(&self, id: &str, rev: &str, doc: Value) -> Result<bool>;

    /// delete the document if `rev` is still current. false = lost the race (or gone)
    async fn delete(&self, id: &str, rev: &str) -> Result<bool>;

    async fn find(&self, selector: &Selector) -> Result<Vec<Value>>;
}

/// Durable repository for clients, authorization codes and access tokens
#[derive(Clone)]
pub struct TokenStore {
    backend: Arc<dyn DocumentBackend + Send + Sync>,
}

impl TokenStore {
    pub fn new(backend: Arc<dyn DocumentBackend + Send + Sync>) -> Self {
        Self { backend }
    }

    /// 256 bits from the OS rng, url-safe base64
    pub fn generate_secret() -> String {
        let mut buf = [0u8; SECRET_BYTES];
        rand::rng().fill_bytes(&mut buf);
        URL_SAFE_NO_PAD.encode(buf)
    }

    pub async fn get_client(&self, id: &str) -> Result<Option<Client>> {
        if id.is_empty() {
            return Ok(None);
        }
        match self.backend.get(&client_doc_id(id)).await? {
            Some(doc) => Ok(Some(from_doc(doc)?)),
            None => Ok(None),
        }
    }

    /// Seed a client if absent. Returns the stored client and whether it was created now.
    pub async fn ensure_client(
        &self,
        id: &str,
        name: &str,
        redirect_uri: &str,
    ) -> Result<(Client, bool)> {
        if let Some(existing) = self.get_client(id).await? {
            return Ok((existing, false));
        }

        let client = Client {
            id: id.to_string(),
            name: name.to_string(),
            secret: Self::generate_secret(),
            redirect_uri: redirect_uri.to_string(),
        };

        match self
            .backend
            .insert(&client_doc_id(id), to_doc(CLIENT_TYPE, &client)?)
            .await
        {
            Ok(()) => Ok((client, true)),
            // someone else seeded it between our read and write
            Err(StorageError::Conflict(_)) => match self.get_client(id).await? {
                Some(existing) => Ok((existing, false)),
                None => Err(StorageError::Conflict(format!(
                    "client {} conflicted but cannot be read back",
                    id
                ))),
            },
            Err(e) => Err(e),
        }
    }

    /// Register a client under a fresh id. The secret is only ever handed out here.
    pub async fn create_client(&self, name: &str, redirect_uri: &str) -> Result<Client> {
        let client = Client {
            id: Uuid::new_v4().simple().to_string(),
            name: name.to_string(),
            secret: Self::generate_secret(),
            redirect_uri: redirect_uri.to_string(),
        };
        self.backend
            .insert(&client_doc_id(&client.id), to_doc(CLIENT_TYPE, &client)?)
            .await?;
        Ok(client)
    }

    pub async fn save_authorization_code(&self, code: &AuthorizationCode) -> Result<()> {
        self.backend
            .insert(&authcode_doc_id(&code.code), to_doc(AUTHCODE_TYPE, code)?)
            .await
    }

    /// Look a code up without consuming it
    pub async fn load_authorization_code(
        &self,
        raw: &str,
    ) -> Result<Option<(AuthorizationCode, Client)>> {
        if raw.is_empty() {
            return Ok(None);
        }
        let Some(doc) = self.backend.get(&authcode_doc_id(raw)).await? else {
            return Ok(None);
        };
        let code: AuthorizationCode = from_doc(doc)?;
        let client_id = code.client_id.clone();
        self.join_client(code, &client_id).await
    }

    /// Atomic read-then-delete. Of two concurrent callers with the same code,
    /// exactly one gets the record back.
    pub async fn consume_authorization_code(
        &self,
        raw: &str,
    ) -> Result<Option<(AuthorizationCode, Client)>> {
        if raw.is_empty() {
            return Ok(None);
        }
        let id = authcode_doc_id(raw);
        let Some(doc) = self.backend.get(&id).await? else {
            return Ok(None);
        };
        let rev = revision(&doc)?;
        let code: AuthorizationCode = from_doc(doc)?;

        if !self.backend.delete(&id, &rev).await? {
            tracing::debug!("lost the race consuming an authorization code");
            return Ok(None);
        }

        let client_id = code.client_id.clone();
        self.join_client(code, &client_id).await
    }

    pub async fn delete_authorization_code(&self, raw: &str) -> Result<()> {
        if raw.is_empty() {
            return Ok(());
        }
        let id = authcode_doc_id(raw);
        if let Some(doc) = self.backend.get(&id).await? {
            let rev = revision(&doc)?;
            self.backend.delete(&id, &rev).await?;
        }
        Ok(())
    }

    pub async fn save_access_token(&self, token: &AccessToken) -> Result<()> {
        self.backend
            .insert(
                &access_doc_id(&token.access_token),
                to_doc(ACCESS_TYPE, token)?,
            )
            .await
    }

    pub async fn find_by_access_token(&self, raw: &str) -> Result<Option<(AccessToken, Client)>> {
        if raw.is_empty() {
            return Ok(None);
        }
        let Some(doc) = self.backend.get(&access_doc_id(raw)).await? else {
            return Ok(None);
        };
        let token: AccessToken = from_doc(doc)?;
        let client_id = token.client_id.clone();
        self.join_client(token, &client_id).await
    }

    pub async fn find_by_refresh_token(
        &self,
        raw: &str,
    ) -> Result<Option<(AccessToken, Client)>> {
        if raw.is_empty() {
            return Ok(None);
        }
        let selector = Selector::of_type(ACCESS_TYPE).field_eq("refresh_token", raw);
        let Some(doc) = self.backend.find(&selector).await?.into_iter().next() else {
            return Ok(None);
        };
        let token: AccessToken = from_doc(doc)?;
        let client_id = token.client_id.clone();
        self.join_client(token, &client_id).await
    }

    pub async fn delete_access_token(&self, raw: &str) -> Result<()> {
        if raw.is_empty() {
            return Ok(());
        }
        let id = access_doc_id(raw);
        if let Some(doc) = self.backend.get(&id).await? {
            let rev = revision(&doc)?;
            self.backend.delete(&id, &rev).await?;
        }
        Ok(())
    }

    /// Empty the refresh field on every record carrying `raw`, keeping the records.
    /// Each update is revision-checked; returns how many this call actually changed,
    /// so 0 means the token was unknown or someone else rotated it first.
    pub async fn invalidate_refresh_token(&self, raw: &str) -> Result<usize> {
        if raw.is_empty() {
            return Ok(0);
        }
        let selector = Selector::of_type(ACCESS_TYPE).field_eq("refresh_token", raw);
        let mut changed = 0;
        for mut doc in self.backend.find(&selector).await? {
            let id = document_id(&doc)?;
            let rev = revision(&doc)?;
            if let Some(fields) = doc.as_object_mut() {
                fields.insert("refresh_token".to_string(), json!(""));
                fields.remove("_rev");
            }
            if self.backend.update(&id, &rev, doc).await? {
                changed += 1;
            }
        }
        Ok(changed)
    }

    /// Drop expired codes and expired tokens that can no longer be refreshed
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut purged = 0;

        for doc in self.backend.find(&Selector::of_type(AUTHCODE_TYPE)).await? {
            let id = document_id(&doc)?;
            let rev = revision(&doc)?;
            let code: AuthorizationCode = from_doc(doc)?;
            if code.is_expired_at(now) && self.backend.delete(&id, &rev).await? {
                purged += 1;
            }
        }

        let dead = Selector::of_type(ACCESS_TYPE).field_eq("refresh_token", "");
        for doc in self.backend.find(&dead).await? {
            let id = document_id(&doc)?;
            let rev = revision(&doc)?;
            let token: AccessToken = from_doc(doc)?;
            if token.is_expired_at(now) && self.backend.delete(&id, &rev).await? {
                purged += 1;
            }
        }

        Ok(purged)
    }

    /// a record whose client has disappeared reads as not found
    async fn join_client<T>(&self, record: T, client_id: &str) -> Result<Option<(T, Client)>> {
        match self.get_client(client_id).await? {
            Some(client) => Ok(Some((record, client))),
            None => {
                tracing::warn!(
                    "record references missing client {}, treating as not found",
                    client_id
                );
                Ok(None)
            }
        }
    }
}

fn client_doc_id(id: &str) -> String {
    format!("{}:{}", CLIENT_TYPE, id)
}

fn authcode_doc_id(code: &str) -> String {
    format!("{}:{}", AUTHCODE_TYPE, code)
}

fn access_doc_id(token: &str) -> String {
    format!("{}:{}", ACCESS_TYPE, token)
}

fn to_doc<T: Serialize>(doc_type: &str, record: &T) -> Result<Value> {
    let mut doc = serde_json::to_value(record)?;
    match doc.as_object_mut() {
        Some(fields) => {
            fields.insert("type".to_string(), json!(doc_type));
            Ok(doc)
        }
        None => Err(StorageError::Malformed(format!(
            "{} record did not serialize to an object",
            doc_type
        ))),
    }
}

fn from_doc<T: DeserializeOwned>(doc: Value) -> Result<T> {
    Ok(serde_json::from_value(doc)?)
}

fn document_id(doc: &Value) -> Result<String> {
    doc.get("_id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| StorageError::Malformed("document without _id".to_string()))
}

fn revision(doc: &Value) -> Result<String> {
    doc.get("_rev")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| StorageError::Malformed("document without _rev".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn store() -> TokenStore {
        TokenStore::new(Arc::new(MemoryBackend::new()))
    }

    fn code_for(client: &Client, raw: &str) -> AuthorizationCode {
        AuthorizationCode {
            client_id: client.id.clone(),
            code: raw.to_string(),
            scope: "profile".to_string(),
            redirect_uri: client.redirect_uri.clone(),
            state: "xyz".to_string(),
            user_id: Some("alice".to_string()),
            created_at: Utc::now(),
            expires_in: 250,
        }
    }

    fn token_for(client: &Client, access: &str, refresh: &str) -> AccessToken {
        AccessToken {
            id: Uuid::new_v4().simple().to_string(),
            client_id: client.id.clone(),
            access_token: access.to_string(),
            refresh_token: refresh.to_string(),
            scope: "profile".to_string(),
            redirect_uri: client.redirect_uri.clone(),
            user_id: Some("alice".to_string()),
            created_at: Utc::now(),
            expires_in: 3600,
        }
    }

    #[test]
    fn test_generated_secrets_are_256_bits() {
        let a = TokenStore::generate_secret();
        let b = TokenStore::generate_secret();
        assert_ne!(a, b);
        assert_eq!(URL_SAFE_NO_PAD.decode(&a).unwrap().len(), 32);
    }

    #[test]
    fn test_selector_matching() {
        let selector = Selector::of_type("access").field_eq("refresh_token", "r1");
        assert!(selector.matches(&json!({"type": "access", "refresh_token": "r1"})));
        assert!(!selector.matches(&json!({"type": "access", "refresh_token": ""})));
        assert!(!selector.matches(&json!({"type": "authcode", "refresh_token": "r1"})));
        assert_eq!(
            selector.to_mango(),
            json!({"type": "access", "refresh_token": "r1"})
        );
    }

    #[tokio::test]
    async fn test_ensure_client_is_idempotent() {
        let store = store();
        let (first, created) = store
            .ensure_client("c1", "App", "https://app.example/cb")
            .await
            .unwrap();
        assert!(created);
        let (second, created_again) = store
            .ensure_client("c1", "Renamed", "https://other.example/cb")
            .await
            .unwrap();
        assert!(!created_again);
        assert_eq!(first.secret, second.secret);
        assert_eq!(second.name, "App");
        assert_eq!(second.redirect_uri, "https://app.example/cb");
    }

    #[tokio::test]
    async fn test_create_client_generates_unique_ids() {
        let store = store();
        let a = store.create_client("A", "https://a.example/cb").await.unwrap();
        let b = store.create_client("B", "https://b.example/cb").await.unwrap();
        assert_ne!(a.id, b.id);
        assert_ne!(a.secret, b.secret);
        let loaded = store.get_client(&a.id).await.unwrap().unwrap();
        assert_eq!(loaded.secret, a.secret);
    }

    #[tokio::test]
    async fn test_get_client_unknown_and_empty() {
        let store = store();
        assert!(store.get_client("nope").await.unwrap().is_none());
        assert!(store.get_client("").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_code_is_a_storage_error() {
        let store = store();
        let client = store.create_client("A", "https://a.example/cb").await.unwrap();
        store
            .save_authorization_code(&code_for(&client, "dup"))
            .await
            .unwrap();
        let err = store
            .save_authorization_code(&code_for(&client, "dup"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_consume_code_only_once() {
        let store = store();
        let client = store.create_client("A", "https://a.example/cb").await.unwrap();
        store
            .save_authorization_code(&code_for(&client, "code-1"))
            .await
            .unwrap();

        let (code, owner) = store
            .consume_authorization_code("code-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(code.state, "xyz");
        assert_eq!(owner.id, client.id);

        assert!(store
            .consume_authorization_code("code-1")
            .await
            .unwrap()
            .is_none());
        assert!(store
            .load_authorization_code("code-1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_concurrent_consume_has_one_winner() {
        let backend = InterleavingBackend::new();
        let store = TokenStore::new(Arc::new(backend.clone()));
        let client = store.create_client("A", "https://a.example/cb").await.unwrap();
        store
            .save_authorization_code(&code_for(&client, "race"))
            .await
            .unwrap();

        let (a, b) = tokio::join!(
            store.consume_authorization_code("race"),
            store.consume_authorization_code("race")
        );
        let winners = [a.unwrap(), b.unwrap()]
            .iter()
            .filter(|r| r.is_some())
            .count();
        assert_eq!(winners, 1);
        assert!(backend.inner().get("authcode:race").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dangling_client_reads_as_not_found() {
        let store = store();
        let ghost = Client {
            id: "ghost".into(),
            name: "Gone".into(),
            secret: "s".into(),
            redirect_uri: "https://gone.example/cb".into(),
        };
        store
            .save_authorization_code(&code_for(&ghost, "orphan"))
            .await
            .unwrap();
        store
            .save_access_token(&token_for(&ghost, "orphan-at", "orphan-rt"))
            .await
            .unwrap();

        assert!(store.load_authorization_code("orphan").await.unwrap().is_none());
        assert!(store.find_by_access_token("orphan-at").await.unwrap().is_none());
        assert!(store.find_by_refresh_token("orphan-rt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalidate_refresh_token() {
        let store = store();
        let client = store.create_client("A", "https://a.example/cb").await.unwrap();
        store
            .save_access_token(&token_for(&client, "at-1", "rt-1"))
            .await
            .unwrap();

        assert_eq!(store.invalidate_refresh_token("rt-1").await.unwrap(), 1);
        assert!(store.find_by_refresh_token("rt-1").await.unwrap().is_none());

        // the record itself survives
        let (token, _) = store.find_by_access_token("at-1").await.unwrap().unwrap();
        assert_eq!(token.refresh_token, "");

        assert_eq!(store.invalidate_refresh_token("rt-1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_invalidate_empty_refresh_token_is_noop() {
        let store = store();
        let client = store.create_client("A", "https://a.example/cb").await.unwrap();
        store
            .save_access_token(&token_for(&client, "at-1", ""))
            .await
            .unwrap();
        assert_eq!(store.invalidate_refresh_token("").await.unwrap(), 0);
        assert!(store.find_by_refresh_token("").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_access_token() {
        let store = store();
        let client = store.create_client("A", "https://a.example/cb").await.unwrap();
        store
            .save_access_token(&token_for(&client, "at-1", "rt-1"))
            .await
            .unwrap();
        store.delete_access_token("at-1").await.unwrap();
        assert!(store.find_by_access_token("at-1").await.unwrap().is_none());
        // deleting again is fine
        store.delete_access_token("at-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = store();
        let client = store.create_client("A", "https://a.example/cb").await.unwrap();
        let long_ago = Utc::now() - Duration::hours(2);

        let mut stale_code = code_for(&client, "stale");
        stale_code.created_at = long_ago;
        store.save_authorization_code(&stale_code).await.unwrap();
        store
            .save_authorization_code(&code_for(&client, "fresh"))
            .await
            .unwrap();

        let mut dead = token_for(&client, "dead", "");
        dead.created_at = long_ago;
        store.save_access_token(&dead).await.unwrap();
        // expired but still refreshable, stays
        let mut refreshable = token_for(&client, "old", "rt-old");
        refreshable.created_at = long_ago;
        store.save_access_token(&refreshable).await.unwrap();

        assert_eq!(store.purge_expired(Utc::now()).await.unwrap(), 2);
        assert!(store.load_authorization_code("stale").await.unwrap().is_none());
        assert!(store.load_authorization_code("fresh").await.unwrap().is_some());
        assert!(store.find_by_access_token("dead").await.unwrap().is_none());
        assert!(store.find_by_refresh_token("rt-old").await.unwrap().is_some());
    }
}
