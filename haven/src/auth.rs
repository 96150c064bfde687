use crate::db;
use crate::db::Store;
use crate::routes::AppState;
use crate::AppError;
use anyhow::ensure;
use anyhow::Context;
use anyhow::Result;
use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::header;
use axum::http::request::Parts;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::Algorithm;
use jsonwebtoken::DecodingKey;
use jsonwebtoken::EncodingKey;
use jsonwebtoken::Header;
use jsonwebtoken::Validation;
use overlay_node::group_key::GroupKeyResolver;
use overlay_node::group_key::ResolveError;
use rand::Rng;
use rsa::BigUint;
use rsa::Oaep;
use rsa::RsaPublicKey;
use serde::Deserialize;
use serde::Serialize;
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;
use tokio::task::spawn_blocking;

/// Lifetime of an issued bearer token.
pub const TOKEN_EXPIRATION: Duration = Duration::from_secs(24 * 60 * 60);

/// The `user` claim value marking the administrator.
pub const ADMIN_USER: &str = "admin";

/// Who a verified bearer token belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    Admin,
    Wallet(String),
}

impl Principal {
    pub fn from_claim(user: &str) -> Principal {
        if user == ADMIN_USER {
            Principal::Admin
        } else {
            Principal::Wallet(user.to_string())
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Principal::Admin => ADMIN_USER,
            Principal::Wallet(wallet) => wallet,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    authorized: bool,
    user: String,
    exp: u64,
}

/// Issues challenges and bearer tokens for wallet users and the
/// administrator.
pub struct Authenticator {
    secret: String,
    admin_key: Option<String>,
    store: Arc<Store>,
    group_keys: Arc<GroupKeyResolver>,
}

impl Authenticator {
    pub fn new(
        secret: String,
        admin_key: Option<String>,
        store: Arc<Store>,
        group_keys: Arc<GroupKeyResolver>,
    ) -> Self {
        Self {
            secret,
            admin_key,
            store,
            group_keys,
        }
    }

    /// Registers a new wallet with its public key and returns the encrypted
    /// first challenge.
    pub async fn register(&self, wallet: &str, jwk: &str) -> Result<Vec<u8>, AppError> {
        let public_key = parse_public_key(jwk)
            .map_err(|e| AppError::BadRequest(format!("Cannot parse key: {e:#}")))?;

        let store = self.store.clone();
        let wallet = wallet.to_string();
        let jwk = jwk.to_string();
        spawn_blocking(move || {
            let conn = store.conn();

            if db::keys::get(&conn, &wallet)
                .map_err(|e| AppError::InternalServerError(format!("{e:#}")))?
                .is_some()
            {
                return Err(AppError::Conflict("Wallet already registered".to_string()));
            }

            let challenge = new_challenge();
            db::keys::insert(&conn, &wallet, &jwk, &challenge)
                .map_err(|e| AppError::InternalServerError(format!("{e:#}")))?;

            encrypt_challenge(&public_key, &challenge)
                .map_err(|e| AppError::InternalServerError(format!("{e:#}")))
        })
        .await
        .map_err(|e| AppError::InternalServerError(format!("{e:#}")))?
    }

    /// Issues a fresh challenge for `wallet`, fetching the public key from
    /// the group topic if this node has never seen the wallet.
    pub async fn wallet_challenge(&self, wallet: &str) -> Result<Vec<u8>, AppError> {
        let jwk = match self.stored_key(wallet).await? {
            Some(jwk) => jwk,
            None => self.resolve_and_persist_key(wallet).await?,
        };

        let public_key = parse_public_key(&jwk)
            .map_err(|e| AppError::BadRequest(format!("Cannot parse key: {e:#}")))?;

        let store = self.store.clone();
        let wallet = wallet.to_string();
        spawn_blocking(move || {
            let challenge = new_challenge();
            let conn = store.conn();
            let updated = db::keys::set_challenge(&conn, &wallet, &challenge)
                .map_err(|e| AppError::InternalServerError(format!("{e:#}")))?;

            if !updated {
                return Err(AppError::Unauthorized("Unknown wallet".to_string()));
            }

            encrypt_challenge(&public_key, &challenge)
                .map_err(|e| AppError::InternalServerError(format!("{e:#}")))
        })
        .await
        .map_err(|e| AppError::InternalServerError(format!("{e:#}")))?
    }

    /// Validates the returned challenge plaintext and issues a bearer token.
    pub async fn login_wallet(&self, wallet: &str, candidate: &str) -> Result<String, AppError> {
        let store = self.store.clone();
        let owned_wallet = wallet.to_string();
        let candidate = candidate.to_string();
        let consumed = spawn_blocking(move || {
            let conn = store.conn();
            db::keys::consume_challenge(&conn, &owned_wallet, &candidate)
        })
        .await
        .map_err(|e| AppError::InternalServerError(format!("{e:#}")))?
        .map_err(|e| AppError::InternalServerError(format!("{e:#}")))?;

        if !consumed {
            return Err(AppError::Unauthorized("Invalid challenge".to_string()));
        }

        issue_token(&self.secret, &Principal::Wallet(wallet.to_string()))
            .map_err(|e| AppError::InternalServerError(format!("{e:#}")))
    }

    /// Issues a fresh challenge encrypted with the administrator key from
    /// the environment.
    pub async fn admin_challenge(&self) -> Result<Vec<u8>, AppError> {
        let admin_key = self
            .admin_key
            .clone()
            .ok_or_else(|| AppError::InternalServerError("Admin key not configured".to_string()))?;

        let public_key = parse_public_key(&admin_key)
            .map_err(|e| AppError::BadRequest(format!("Cannot parse key: {e:#}")))?;

        let store = self.store.clone();
        spawn_blocking(move || {
            let challenge = new_challenge();
            let conn = store.conn();
            db::admin::set_challenge(&conn, &challenge)
                .map_err(|e| AppError::InternalServerError(format!("{e:#}")))?;

            encrypt_challenge(&public_key, &challenge)
                .map_err(|e| AppError::InternalServerError(format!("{e:#}")))
        })
        .await
        .map_err(|e| AppError::InternalServerError(format!("{e:#}")))?
    }

    pub async fn login_admin(&self, candidate: &str) -> Result<String, AppError> {
        let store = self.store.clone();
        let candidate = candidate.to_string();
        let consumed = spawn_blocking(move || {
            let conn = store.conn();
            db::admin::consume_challenge(&conn, &candidate)
        })
        .await
        .map_err(|e| AppError::InternalServerError(format!("{e:#}")))?
        .map_err(|e| AppError::InternalServerError(format!("{e:#}")))?;

        if !consumed {
            return Err(AppError::Unauthorized("Invalid challenge".to_string()));
        }

        issue_token(&self.secret, &Principal::Admin)
            .map_err(|e| AppError::InternalServerError(format!("{e:#}")))
    }

    pub fn verify_token(&self, token: &str) -> Result<Principal, AppError> {
        verify_token(&self.secret, token)
            .map_err(|_| AppError::Unauthorized("Unauthorized".to_string()))
    }

    async fn stored_key(&self, wallet: &str) -> Result<Option<String>, AppError> {
        let store = self.store.clone();
        let wallet = wallet.to_string();
        let user = spawn_blocking(move || {
            let conn = store.conn();
            db::keys::get(&conn, &wallet)
        })
        .await
        .map_err(|e| AppError::InternalServerError(format!("{e:#}")))?
        .map_err(|e| AppError::InternalServerError(format!("{e:#}")))?;

        Ok(user.map(|user| user.key))
    }

    /// First contact: asks the group topic for the wallet's key and persists
    /// it before any challenge is issued.
    async fn resolve_and_persist_key(&self, wallet: &str) -> Result<String, AppError> {
        let jwk = self.group_keys.resolve(wallet).await.map_err(|e| match e {
            ResolveError::NotFound => AppError::Unauthorized("Unknown wallet".to_string()),
            ResolveError::Store(e) => AppError::InternalServerError(format!("{e:#}")),
        })?;

        let store = self.store.clone();
        let wallet = wallet.to_string();
        let persisted_jwk = jwk.clone();
        spawn_blocking(move || {
            let conn = store.conn();
            db::keys::store_resolved_key(&conn, &wallet, &persisted_jwk)
        })
        .await
        .map_err(|e| AppError::InternalServerError(format!("{e:#}")))?
        .map_err(|e| AppError::InternalServerError(format!("{e:#}")))?;

        Ok(jwk)
    }
}

/// A uniformly random decimal challenge.
///
/// The original protocol used up to seven digits; the shape (a decimal
/// string) is kept but the value carries the full 128 bits.
fn new_challenge() -> String {
    rand::thread_rng().gen::<u128>().to_string()
}

/// RSA public key in JWK form, as clients submit it.
#[derive(Debug, Serialize, Deserialize)]
struct Jwk {
    kty: String,
    n: String,
    e: String,
}

pub fn parse_public_key(jwk: &str) -> Result<RsaPublicKey> {
    let jwk = serde_json::from_str::<Jwk>(jwk).context("Key is not a JWK")?;
    ensure!(jwk.kty == "RSA", "Unsupported key type {}", jwk.kty);

    let n = URL_SAFE_NO_PAD
        .decode(jwk.n.as_bytes())
        .context("Invalid modulus encoding")?;
    let e = URL_SAFE_NO_PAD
        .decode(jwk.e.as_bytes())
        .context("Invalid exponent encoding")?;

    let key = RsaPublicKey::new(BigUint::from_bytes_be(&n), BigUint::from_bytes_be(&e))
        .context("Invalid RSA public key")?;

    Ok(key)
}

pub fn encrypt_challenge(public_key: &RsaPublicKey, challenge: &str) -> Result<Vec<u8>> {
    let ciphertext = public_key
        .encrypt(
            &mut rand::thread_rng(),
            Oaep::new::<Sha256>(),
            challenge.as_bytes(),
        )
        .context("Failed to encrypt challenge")?;

    Ok(ciphertext)
}

pub fn issue_token(secret: &str, principal: &Principal) -> Result<String> {
    let exp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("Clock is before the epoch")?
        .as_secs()
        + TOKEN_EXPIRATION.as_secs();

    let claims = Claims {
        authorized: true,
        user: principal.name().to_string(),
        exp,
    };

    let token = jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .context("Failed to sign token")?;

    Ok(token)
}

/// Verifies signature and expiry. Only HMAC-SHA-256 is accepted; tokens
/// signed with any other algorithm fail validation.
pub fn verify_token(secret: &str, token: &str) -> Result<Principal> {
    let data = jsonwebtoken::decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )
    .context("Invalid token")?;

    ensure!(data.claims.authorized, "Token is not authorized");

    Ok(Principal::from_claim(&data.claims.user))
}

/// Extracts the bearer token from the `Authorization` header or, for legacy
/// clients, the `token` cookie.
pub fn token_from_parts(parts: &Parts) -> Option<String> {
    if let Some(value) = parts.headers.get(header::AUTHORIZATION) {
        if let Ok(value) = value.to_str() {
            if let Some(token) = value.strip_prefix("Bearer ") {
                return Some(token.trim().to_string());
            }
        }
    }

    let cookies = parts.headers.get(header::COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|cookie| {
        let (name, value) = cookie.trim().split_once('=')?;
        (name == "token").then(|| value.to_string())
    })
}

/// A request authenticated as a wallet user or the administrator.
pub struct AuthUser(pub Principal);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = token_from_parts(parts)
            .ok_or_else(|| AppError::Unauthorized("Missing token".to_string()))?;

        let principal = state.auth.verify_token(&token)?;

        if let Principal::Wallet(wallet) = &principal {
            // The token may outlive the record, e.g. after a database reset.
            let store = state.store.clone();
            let wallet = wallet.clone();
            let known = spawn_blocking(move || {
                let conn = store.conn();
                db::keys::get(&conn, &wallet)
            })
            .await
            .map_err(|e| AppError::InternalServerError(format!("{e:#}")))?
            .map_err(|e| AppError::InternalServerError(format!("{e:#}")))?
            .is_some();

            if !known {
                return Err(AppError::Unauthorized("User not found".to_string()));
            }
        }

        Ok(AuthUser(principal))
    }
}

/// Like [`AuthUser`] but optional: endpoints that only gate private content
/// extract this and decide later whether identity is required.
pub struct MaybeAuthUser(pub Option<Principal>);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for MaybeAuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        match AuthUser::from_request_parts(parts, state).await {
            Ok(AuthUser(principal)) => Ok(MaybeAuthUser(Some(principal))),
            Err(_) => Ok(MaybeAuthUser(None)),
        }
    }
}

/// A request authenticated as the administrator.
pub struct AdminUser;

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AdminUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let AuthUser(principal) = AuthUser::from_request_parts(parts, state).await?;

        match principal {
            Principal::Admin => Ok(AdminUser),
            Principal::Wallet(_) => Err(AppError::Unauthorized("Unauthorized".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeStorage;
    use overlay_node::node::OverlayConfig;
    use overlay_node::node::OverlayNode;
    use rsa::traits::PublicKeyParts;
    use rsa::RsaPrivateKey;

    fn jwk_for(key: &RsaPublicKey) -> String {
        serde_json::to_string(&Jwk {
            kty: "RSA".to_string(),
            n: URL_SAFE_NO_PAD.encode(key.n().to_bytes_be()),
            e: URL_SAFE_NO_PAD.encode(key.e().to_bytes_be()),
        })
        .unwrap()
    }

    fn decrypt(private_key: &RsaPrivateKey, ciphertext: &[u8]) -> String {
        let plaintext = private_key.decrypt(Oaep::new::<Sha256>(), ciphertext).unwrap();
        String::from_utf8(plaintext).unwrap()
    }

    #[test]
    fn challenge_is_a_decimal_string() {
        let challenge = new_challenge();

        assert!(!challenge.is_empty());
        assert!(challenge.len() <= 39);
        assert!(challenge.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn encrypted_challenge_decrypts_to_the_nonce() {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let public_key = private_key.to_public_key();

        let parsed = parse_public_key(&jwk_for(&public_key)).unwrap();
        let ciphertext = encrypt_challenge(&parsed, "12345").unwrap();

        assert_eq!(decrypt(&private_key, &ciphertext), "12345");
    }

    #[test]
    fn rejects_non_rsa_jwk() {
        let result = parse_public_key(r#"{"kty":"EC","n":"AQ","e":"AQ"}"#);
        assert!(result.is_err());

        let result = parse_public_key("not json");
        assert!(result.is_err());
    }

    #[test]
    fn token_roundtrip() {
        let token = issue_token("secret", &Principal::Wallet("w1".to_string())).unwrap();
        let principal = verify_token("secret", &token).unwrap();
        assert_eq!(principal, Principal::Wallet("w1".to_string()));

        let token = issue_token("secret", &Principal::Admin).unwrap();
        let principal = verify_token("secret", &token).unwrap();
        assert_eq!(principal, Principal::Admin);
    }

    #[test]
    fn token_with_the_wrong_secret_is_rejected() {
        let token = issue_token("secret", &Principal::Admin).unwrap();

        assert!(verify_token("other", &token).is_err());
        assert!(verify_token("secret", "garbage").is_err());
    }

    async fn test_authenticator() -> Authenticator {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let overlay = Arc::new(
            OverlayNode::spawn(OverlayConfig {
                tcp_port: 0,
                udp_port: 0,
                bootstrap: None,
            })
            .await
            .unwrap(),
        );
        let group_keys = Arc::new(
            GroupKeyResolver::spawn_with_timeout(
                overlay,
                Arc::new(NodeStorage::new(store.clone())),
                "group-test".to_string(),
                Duration::from_millis(200),
            )
            .await
            .unwrap(),
        );

        Authenticator::new("secret".to_string(), None, store, group_keys)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn register_login_roundtrip() {
        let auth = test_authenticator().await;

        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let jwk = jwk_for(&private_key.to_public_key());

        let ciphertext = auth.register("w1", &jwk).await.unwrap();
        let challenge = decrypt(&private_key, &ciphertext);

        // A wallet can only register once.
        let conflict = auth.register("w1", &jwk).await;
        assert!(matches!(conflict, Err(AppError::Conflict(_))));

        let token = auth.login_wallet("w1", &challenge).await.unwrap();
        let principal = auth.verify_token(&token).unwrap();
        assert_eq!(principal, Principal::Wallet("w1".to_string()));

        // The challenge was cleared on use; replaying the plaintext fails.
        let replay = auth.login_wallet("w1", &challenge).await;
        assert!(matches!(replay, Err(AppError::Unauthorized(_))));

        // A fresh challenge unlocks a fresh login.
        let ciphertext = auth.wallet_challenge("w1").await.unwrap();
        let challenge = decrypt(&private_key, &ciphertext);
        auth.login_wallet("w1", &challenge).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn challenge_for_an_unresolvable_wallet_is_unauthorized() {
        let auth = test_authenticator().await;

        let result = auth.wallet_challenge("nobody-knows-this-wallet").await;
        assert!(matches!(result, Err(AppError::Unauthorized(_))));
    }
}
