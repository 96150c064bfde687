use crate::admin;
use crate::auth::AuthUser;
use crate::auth::Authenticator;
use crate::auth::MaybeAuthUser;
use crate::auth::Principal;
use crate::db;
use crate::db::Store;
use crate::gate;
use crate::ledger::LedgerOracle;
use crate::node::Node;
use crate::AppError;
use axum::extract::DefaultBodyLimit;
use axum::extract::Multipart;
use axum::extract::Query;
use axum::extract::State;
use axum::http::header;
use axum::http::HeaderValue;
use axum::http::Method;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::post;
use axum::Json;
use axum::Router;
use overlay_node::inbox::DeliveryStatus;
use overlay_node::ArtifactId;
use serde::Deserialize;
use serde::Serialize;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::task::spawn_blocking;
use tower_http::cors::AllowOrigin;
use tower_http::cors::CorsLayer;

pub struct AppState {
    pub node: Node,
    pub store: Arc<Store>,
    pub auth: Authenticator,
    pub oracle: Arc<dyn LedgerOracle>,
}

pub fn router(app_state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);

    Router::new()
        .route("/registerKey", post(register_key))
        .route("/challange", get(get_challenge))
        .route("/loginChal", post(login_with_challenge))
        .route("/loginCheck", get(login_check))
        .route("/upload", post(upload))
        .route("/img", get(get_image))
        .route("/feedback", post(post_feedback))
        .route("/getInfo", get(get_info))
        .route("/messages", get(get_messages))
        .route("/sendMessage", post(send_message))
        .route("/adminChal", get(admin::get_admin_challenge))
        .route("/adminLogin", post(admin::login_admin))
        .route("/adminAllImages", get(admin::all_images))
        .route("/adminSetImageActivity", post(admin::set_image_activity))
        .route("/adminFeedback", get(admin::all_feedback))
        // Uploads are bounded by the same cap as overlay transfers.
        .layer(DefaultBodyLimit::max(overlay_node::wire::MAX_TRANSFER_BYTES))
        .layer(cors)
        .with_state(app_state)
}

#[derive(Deserialize)]
pub struct RegisterKeyBody {
    wallet: String,
    key: String,
}

/// Registers a wallet's public key; the response body is the RSA-OAEP
/// ciphertext of the first login challenge.
pub async fn register_key(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RegisterKeyBody>,
) -> Result<Vec<u8>, AppError> {
    if body.wallet.is_empty() || body.wallet.contains(':') {
        return Err(AppError::BadRequest("Invalid wallet ID".to_string()));
    }

    state.auth.register(&body.wallet, &body.key).await
}

#[derive(Deserialize)]
pub struct ChallengeParams {
    #[serde(rename = "walletId")]
    wallet_id: String,
}

pub async fn get_challenge(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ChallengeParams>,
) -> Result<Vec<u8>, AppError> {
    if params.wallet_id.is_empty() {
        return Err(AppError::BadRequest("Missing wallet ID".to_string()));
    }

    state.auth.wallet_challenge(&params.wallet_id).await
}

#[derive(Deserialize)]
pub struct LoginBody {
    wallet: String,
    #[serde(rename = "challange")]
    challenge: String,
}

/// Exchanges a decrypted challenge for a bearer token. The token is the
/// response body; a secure cookie carries it as well for legacy clients.
pub async fn login_with_challenge(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LoginBody>,
) -> Result<Response, AppError> {
    let token = state.auth.login_wallet(&body.wallet, &body.challenge).await?;

    let cookie = format!(
        "token={token}; Secure; HttpOnly; SameSite=None; Max-Age={}",
        crate::auth::TOKEN_EXPIRATION.as_secs()
    );
    let cookie = HeaderValue::from_str(&cookie)
        .map_err(|e| AppError::InternalServerError(format!("{e:#}")))?;

    let mut response = token.into_response();
    response.headers_mut().insert(header::SET_COOKIE, cookie);

    Ok(response)
}

/// Authenticated no-op so clients can validate a stored token.
pub async fn login_check(AuthUser(principal): AuthUser) -> String {
    principal.name().to_string()
}

/// Stores an uploaded artifact and returns its local id.
pub async fn upload(
    State(state): State<Arc<AppState>>,
    AuthUser(principal): AuthUser,
    mut multipart: Multipart,
) -> Result<Json<i64>, AppError> {
    let wallet = match principal {
        Principal::Wallet(wallet) => wallet,
        Principal::Admin => {
            return Err(AppError::Unauthorized("Not a wallet user".to_string()));
        }
    };

    let mut post_id = None;
    let mut wallet_id = None;
    let mut image = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(format!("Invalid multipart body: {e}")))?
    {
        match field.name() {
            Some("id") => {
                post_id = Some(field.text().await.map_err(|e| {
                    AppError::BadRequest(format!("Invalid post ID field: {e}"))
                })?);
            }
            Some("walletId") => {
                wallet_id = Some(field.text().await.map_err(|e| {
                    AppError::BadRequest(format!("Invalid wallet ID field: {e}"))
                })?);
            }
            Some("image") => {
                image = Some(field.bytes().await.map_err(|e| {
                    AppError::BadRequest(format!("Invalid image field: {e}"))
                })?);
            }
            _ => continue,
        }
    }

    let post_id = post_id.ok_or_else(|| AppError::BadRequest("Missing post ID".to_string()))?;
    let image = image.ok_or_else(|| AppError::BadRequest("Missing image".to_string()))?;

    if post_id.is_empty() || post_id.contains(':') {
        return Err(AppError::BadRequest("Invalid post ID".to_string()));
    }

    // Artifacts are stored under the authenticated wallet only.
    if wallet_id.as_deref().is_some_and(|form| form != wallet) {
        return Err(AppError::Unauthorized(
            "Wallet does not match token".to_string(),
        ));
    }

    let store = state.store.clone();
    let local_id = spawn_blocking(move || {
        let conn = store.conn();
        db::images::insert(&conn, &wallet, &post_id, &image)
    })
    .await
    .map_err(|e| AppError::InternalServerError(format!("{e:#}")))?
    .map_err(|e| AppError::InternalServerError(format!("Failed to store image: {e:#}")))?;

    Ok(Json(local_id))
}

#[derive(Deserialize)]
pub struct ImageParams {
    id: String,
    tx: Option<String>,
}

/// Returns artifact bytes, consulting the ledger for privacy and payment
/// when a transaction reference is supplied.
pub async fn get_image(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ImageParams>,
    MaybeAuthUser(principal): MaybeAuthUser,
) -> Result<Vec<u8>, AppError> {
    let id = params
        .id
        .parse::<ArtifactId>()
        .map_err(|_| AppError::BadRequest("Invalid image ID".to_string()))?;

    if let Some(tx) = params.tx.as_deref().filter(|tx| !tx.is_empty()) {
        let private = state
            .oracle
            .is_private(&id, tx)
            .await
            .map_err(|e| AppError::ServiceUnavailable(format!("{e:#}")))?
            .unwrap_or(false);

        if private {
            let principal =
                principal.ok_or_else(|| AppError::Unauthorized("Unauthorized".to_string()))?;

            if let Principal::Wallet(wallet) = principal {
                gate::authorize_private_read(state.oracle.as_ref(), &wallet, &id, tx).await?;
            }
        }
    }

    let data = state.node.content.fetch(&id).await?;

    Ok(data)
}

#[derive(Deserialize)]
pub struct FeedbackBody {
    #[serde(rename = "feedbackType")]
    feedback_type: String,
    #[serde(default)]
    target: String,
    content: String,
}

pub async fn post_feedback(
    State(state): State<Arc<AppState>>,
    AuthUser(principal): AuthUser,
    Json(body): Json<FeedbackBody>,
) -> Result<(), AppError> {
    let store = state.store.clone();
    let wallet = principal.name().to_string();
    spawn_blocking(move || {
        let conn = store.conn();
        db::feedback::insert(
            &conn,
            &body.feedback_type,
            &wallet,
            &body.target,
            &body.content,
        )
    })
    .await
    .map_err(|e| AppError::InternalServerError(format!("{e:#}")))?
    .map_err(|e| AppError::InternalServerError(format!("Failed to store feedback: {e:#}")))?;

    Ok(())
}

#[derive(Serialize)]
pub struct InfoResponse {
    wallet: String,
    #[serde(rename = "inboxCount")]
    inbox_count: i64,
    settings: serde_json::Value,
}

pub async fn get_info(
    State(state): State<Arc<AppState>>,
    AuthUser(principal): AuthUser,
) -> Result<Json<InfoResponse>, AppError> {
    let wallet = match principal {
        Principal::Wallet(wallet) => wallet,
        Principal::Admin => {
            return Err(AppError::Unauthorized("Not a wallet user".to_string()));
        }
    };

    let store = state.store.clone();
    let info = spawn_blocking(move || -> anyhow::Result<InfoResponse> {
        let conn = store.conn();
        let user = db::keys::get(&conn, &wallet)?;
        let inbox_count = db::inbox::count_for_user(&conn, &wallet)?;

        let settings = user
            .and_then(|user| serde_json::from_str(&user.settings).ok())
            .unwrap_or_else(|| serde_json::json!({}));

        Ok(InfoResponse {
            wallet,
            inbox_count,
            settings,
        })
    })
    .await
    .map_err(|e| AppError::InternalServerError(format!("{e:#}")))?
    .map_err(|e| AppError::InternalServerError(format!("{e:#}")))?;

    Ok(Json(info))
}

#[derive(Serialize)]
pub struct MessagesResponse {
    messages: Vec<db::inbox::InboxEntry>,
}

pub async fn get_messages(
    State(state): State<Arc<AppState>>,
    AuthUser(principal): AuthUser,
) -> Result<Json<MessagesResponse>, AppError> {
    let wallet = match principal {
        Principal::Wallet(wallet) => wallet,
        Principal::Admin => {
            return Err(AppError::Unauthorized("Not a wallet user".to_string()));
        }
    };

    let store = state.store.clone();
    let messages = spawn_blocking(move || {
        let conn = store.conn();
        db::inbox::for_user(&conn, &wallet)
    })
    .await
    .map_err(|e| AppError::InternalServerError(format!("{e:#}")))?
    .map_err(|e| AppError::InternalServerError(format!("{e:#}")))?;

    Ok(Json(MessagesResponse { messages }))
}

#[derive(Deserialize)]
pub struct SendMessageBody {
    recipient: String,
    message: String,
}

#[derive(Serialize)]
pub struct SendMessageResponse {
    delivered: bool,
}

/// Delivers to the local inbox when the recipient is a user of this node;
/// otherwise broadcasts over the overlay and waits for the remote
/// acknowledgement.
pub async fn send_message(
    State(state): State<Arc<AppState>>,
    AuthUser(principal): AuthUser,
    Json(body): Json<SendMessageBody>,
) -> Result<Json<SendMessageResponse>, AppError> {
    let sender = match principal {
        Principal::Wallet(wallet) => wallet,
        Principal::Admin => {
            return Err(AppError::Unauthorized("Not a wallet user".to_string()));
        }
    };

    if body.recipient.is_empty() || body.message.is_empty() {
        return Err(AppError::BadRequest(
            "Missing recipient or message".to_string(),
        ));
    }

    let store = state.store.clone();
    let recipient = body.recipient.clone();
    let recipient_known = spawn_blocking(move || {
        let conn = store.conn();
        db::keys::get(&conn, &recipient).map(|user| user.is_some())
    })
    .await
    .map_err(|e| AppError::InternalServerError(format!("{e:#}")))?
    .map_err(|e| AppError::InternalServerError(format!("{e:#}")))?;

    if recipient_known {
        let store = state.store.clone();
        let recipient = body.recipient.clone();
        let sender = sender.clone();
        let message = body.message.clone();
        spawn_blocking(move || {
            let conn = store.conn();
            db::inbox::insert(
                &conn,
                &recipient,
                &sender,
                &message,
                OffsetDateTime::now_utc().unix_timestamp(),
            )
        })
        .await
        .map_err(|e| AppError::InternalServerError(format!("{e:#}")))?
        .map_err(|e| AppError::InternalServerError(format!("{e:#}")))?;

        return Ok(Json(SendMessageResponse { delivered: true }));
    }

    let status = state
        .node
        .inbox
        .send(&body.recipient, &sender, &body.message)
        .await
        .map_err(|e| AppError::InternalServerError(format!("{e:#}")))?;

    match status {
        DeliveryStatus::Delivered => Ok(Json(SendMessageResponse { delivered: true })),
        DeliveryStatus::Undelivered => Err(AppError::InternalServerError(
            "Message delivery unconfirmed".to_string(),
        )),
    }
}
