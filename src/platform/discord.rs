//! Discord REST v10 backend.
//!
//! Only the handful of endpoints the reconciler needs. 404 maps to
//! `PlatformError::NotFound`, 403 to `Forbidden`. 429 responses are retried after
//! the advertised `retry_after` as long as the wait stays under the configured cap;
//! beyond that the call fails with `RateLimited` and the next pass picks it up.

use super::{
    Capabilities, Channel, ChannelKind, NewChannel, OverwriteTarget, PermissionOverwrite, Platform,
    PlatformError, PlatformResult, PERMISSION_ADMINISTRATOR, PERMISSION_MANAGE_CHANNELS,
};
use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tokio::sync::OnceCell;

pub const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";
const MAX_RATE_LIMIT_RETRIES: u32 = 3;
const GUILD_PAGE_LIMIT: usize = 200;

#[derive(Debug, Deserialize)]
struct WireChannel {
    id: String,
    #[serde(rename = "type")]
    kind: u8,
    guild_id: Option<String>,
    name: Option<String>,
    parent_id: Option<String>,
    position: Option<i64>,
    #[serde(default)]
    permission_overwrites: Vec<WireOverwrite>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireOverwrite {
    id: String,
    #[serde(rename = "type")]
    kind: u8,
    allow: String,
    deny: String,
}

#[derive(Debug, Serialize)]
struct WireNewChannel<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    kind: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_id: Option<&'a str>,
    position: i64,
    permission_overwrites: Vec<WireOverwrite>,
}

#[derive(Debug, Deserialize)]
struct WireUser {
    id: String,
}

#[derive(Debug, Deserialize)]
struct WireGuild {
    id: String,
}

#[derive(Debug, Deserialize)]
struct WireMember {
    #[serde(default)]
    roles: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireRole {
    pub(crate) id: String,
    pub(crate) permissions: String,
    pub(crate) position: i64,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: Option<String>,
    retry_after: Option<f64>,
}

impl From<&PermissionOverwrite> for WireOverwrite {
    fn from(overwrite: &PermissionOverwrite) -> Self {
        Self {
            id: overwrite.id.clone(),
            kind: match overwrite.target {
                OverwriteTarget::Role => 0,
                OverwriteTarget::Member => 1,
            },
            allow: overwrite.allow.to_string(),
            deny: overwrite.deny.to_string(),
        }
    }
}

impl From<WireOverwrite> for PermissionOverwrite {
    fn from(wire: WireOverwrite) -> Self {
        Self {
            id: wire.id,
            target: if wire.kind == 1 {
                OverwriteTarget::Member
            } else {
                OverwriteTarget::Role
            },
            allow: wire.allow.parse().unwrap_or(0),
            deny: wire.deny.parse().unwrap_or(0),
        }
    }
}

impl WireChannel {
    /// `None` for channels outside a guild (DMs) or in a different guild.
    fn into_channel(self, guild_id: &str) -> Option<Channel> {
        if self.guild_id.as_deref() != Some(guild_id) {
            return None;
        }
        Some(Channel {
            id: self.id,
            guild_id: guild_id.to_string(),
            name: self.name.unwrap_or_default(),
            kind: ChannelKind::from_wire(self.kind),
            parent_id: self.parent_id,
            position: self.position.unwrap_or(0),
            overwrites: self.permission_overwrites.into_iter().map(Into::into).collect(),
        })
    }
}

/// Effective guild-level permissions: @everyone (role id == guild id) plus every
/// role the member holds. Rank is the highest position among held roles.
pub(crate) fn compute_capabilities(guild_id: &str, member_roles: &[String], roles: &[WireRole]) -> Capabilities {
    let mut permissions = 0u64;
    let mut top_role_position = 0i64;
    for role in roles {
        let held = member_roles.iter().any(|id| id == &role.id);
        if role.id == guild_id || held {
            permissions |= role.permissions.parse::<u64>().unwrap_or(0);
        }
        if held {
            top_role_position = top_role_position.max(role.position);
        }
    }
    let manage_channels = permissions & (PERMISSION_ADMINISTRATOR | PERMISSION_MANAGE_CHANNELS) != 0;
    Capabilities {
        manage_channels,
        top_role_position,
    }
}

fn error_for_status(status: StatusCode, body: &str) -> PlatformError {
    let parsed: Option<ApiErrorBody> = serde_json::from_str(body).ok();
    let message = parsed
        .as_ref()
        .and_then(|b| b.message.clone())
        .unwrap_or_else(|| body.to_string());
    match status {
        StatusCode::NOT_FOUND => PlatformError::NotFound(message),
        StatusCode::FORBIDDEN => PlatformError::Forbidden(message),
        StatusCode::TOO_MANY_REQUESTS => PlatformError::RateLimited {
            retry_after_secs: parsed.and_then(|b| b.retry_after).unwrap_or(1.0),
        },
        other => PlatformError::Api {
            status: other.as_u16(),
            message,
        },
    }
}

pub struct DiscordPlatform {
    client: Client,
    api_base: String,
    token: String,
    max_rate_limit_wait: Duration,
    bot_user_id: OnceCell<String>,
}

impl DiscordPlatform {
    pub fn new(api_base: &str, token: &str, timeout: Duration) -> PlatformResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("DiscordBot (stat_channels, ", env!("CARGO_PKG_VERSION"), ")"))
            .build()?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            token: token.to_string(),
            max_rate_limit_wait: Duration::from_secs(30),
            bot_user_id: OnceCell::new(),
        })
    }

    pub fn with_max_rate_limit_wait(mut self, wait: Duration) -> Self {
        self.max_rate_limit_wait = wait;
        self
    }

    async fn send(&self, method: Method, path: &str, body: Option<serde_json::Value>) -> PlatformResult<Response> {
        let url = format!("{}{}", self.api_base, path);
        let mut attempt = 0;
        loop {
            let mut request = self
                .client
                .request(method.clone(), &url)
                .header(AUTHORIZATION, format!("Bot {}", self.token));
            if let Some(body) = &body {
                request = request.json(body);
            }
            let response = request.send().await?;
            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }

            let text = response.text().await.unwrap_or_default();
            match error_for_status(status, &text) {
                PlatformError::RateLimited { retry_after_secs }
                    if attempt < MAX_RATE_LIMIT_RETRIES
                        && retry_after_secs <= self.max_rate_limit_wait.as_secs_f64() =>
                {
                    attempt += 1;
                    tracing::debug!(%method, path, retry_after_secs, attempt, "discord rate limited, waiting");
                    tokio::time::sleep(Duration::from_secs_f64(retry_after_secs.max(0.0))).await;
                }
                err => return Err(err),
            }
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> PlatformResult<T> {
        Ok(self.send(Method::GET, path, None).await?.json().await?)
    }

    async fn patch_channel(&self, channel_id: &str, body: serde_json::Value) -> PlatformResult<()> {
        self.send(Method::PATCH, &format!("/channels/{}", channel_id), Some(body))
            .await?;
        Ok(())
    }

    async fn bot_user_id(&self) -> PlatformResult<&str> {
        let id = self
            .bot_user_id
            .get_or_try_init(|| async move {
                let user: WireUser = self.get_json("/users/@me").await?;
                Ok::<_, PlatformError>(user.id)
            })
            .await?;
        Ok(id.as_str())
    }
}

#[async_trait]
impl Platform for DiscordPlatform {
    async fn capabilities(&self, guild_id: &str) -> PlatformResult<Capabilities> {
        let bot_id = self.bot_user_id().await?.to_string();
        let member = match self
            .get_json::<WireMember>(&format!("/guilds/{}/members/{}", guild_id, bot_id))
            .await
        {
            // The bot can always read its own membership; a denial means it is no longer in the guild.
            Err(PlatformError::Forbidden(message)) => return Err(PlatformError::NotFound(message)),
            other => other?,
        };
        let roles: Vec<WireRole> = self.get_json(&format!("/guilds/{}/roles", guild_id)).await?;
        Ok(compute_capabilities(guild_id, &member.roles, &roles))
    }

    async fn guild_exists(&self, guild_id: &str) -> PlatformResult<bool> {
        match self.get_json::<WireGuild>(&format!("/guilds/{}", guild_id)).await {
            Ok(_) => Ok(true),
            Err(PlatformError::NotFound(_)) | Err(PlatformError::Forbidden(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn list_guilds(&self) -> PlatformResult<Vec<String>> {
        let mut guilds = vec![];
        let mut after: Option<String> = None;
        loop {
            let path = match &after {
                Some(after) => format!("/users/@me/guilds?limit={}&after={}", GUILD_PAGE_LIMIT, after),
                None => format!("/users/@me/guilds?limit={}", GUILD_PAGE_LIMIT),
            };
            let page: Vec<WireGuild> = self.get_json(&path).await?;
            let full_page = page.len() >= GUILD_PAGE_LIMIT;
            after = page.last().map(|guild| guild.id.clone());
            guilds.extend(page.into_iter().map(|guild| guild.id));
            if !full_page {
                return Ok(guilds);
            }
        }
    }

    async fn create_channel(&self, guild_id: &str, channel: NewChannel) -> PlatformResult<Channel> {
        let body = WireNewChannel {
            name: &channel.name,
            kind: channel.kind.to_wire(),
            parent_id: channel.parent_id.as_deref(),
            position: channel.position,
            permission_overwrites: channel.overwrites.iter().map(Into::into).collect(),
        };
        let body = serde_json::to_value(&body).map_err(|err| PlatformError::Api {
            status: 0,
            message: err.to_string(),
        })?;
        let created: WireChannel = self
            .send(Method::POST, &format!("/guilds/{}/channels", guild_id), Some(body))
            .await?
            .json()
            .await?;
        created.into_channel(guild_id).ok_or_else(|| PlatformError::Api {
            status: 200,
            message: "created channel belongs to another guild".to_string(),
        })
    }

    async fn fetch_channel(&self, guild_id: &str, channel_id: &str) -> PlatformResult<Option<Channel>> {
        match self.get_json::<WireChannel>(&format!("/channels/{}", channel_id)).await {
            Ok(wire) => Ok(wire.into_channel(guild_id)),
            Err(PlatformError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn rename_channel(&self, _guild_id: &str, channel_id: &str, name: &str) -> PlatformResult<()> {
        self.patch_channel(channel_id, json!({ "name": name })).await
    }

    async fn move_channel(&self, _guild_id: &str, channel_id: &str, parent_id: &str) -> PlatformResult<()> {
        self.patch_channel(channel_id, json!({ "parent_id": parent_id })).await
    }

    async fn reposition_channel(&self, _guild_id: &str, channel_id: &str, position: i64) -> PlatformResult<()> {
        self.patch_channel(channel_id, json!({ "position": position })).await
    }

    async fn delete_channel(&self, _guild_id: &str, channel_id: &str) -> PlatformResult<()> {
        self.send(Method::DELETE, &format!("/channels/{}", channel_id), None)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::{DesiredState, ReconcileOutcome, Reconciler, ReconcilerSettings};
    use crate::storage::Storage;
    use axum::{
        extract::{Path, Query, State},
        http::StatusCode as AxumStatus,
        routing::{get, post},
        Json, Router,
    };
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::net::TcpListener;

    fn role(id: &str, permissions: u64, position: i64) -> WireRole {
        WireRole {
            id: id.to_string(),
            permissions: permissions.to_string(),
            position,
        }
    }

    #[test]
    fn test_capabilities_from_roles() {
        let roles = vec![
            role("g1", 0, 0),
            role("r-manage", PERMISSION_MANAGE_CHANNELS, 3),
            role("r-admin", PERMISSION_ADMINISTRATOR, 5),
            role("r-plain", 0, 2),
        ];

        let caps = compute_capabilities("g1", &["r-manage".to_string()], &roles);
        assert_eq!(caps, Capabilities { manage_channels: true, top_role_position: 3 });
        assert!(caps.can_manage());

        let caps = compute_capabilities("g1", &["r-admin".to_string(), "r-plain".to_string()], &roles);
        assert!(caps.manage_channels);
        assert_eq!(caps.top_role_position, 5);

        let caps = compute_capabilities("g1", &["r-plain".to_string()], &roles);
        assert!(!caps.can_manage());

        // @everyone may grant the permission but never gives rank
        let roles = vec![role("g1", PERMISSION_MANAGE_CHANNELS, 0)];
        let caps = compute_capabilities("g1", &[], &roles);
        assert!(caps.manage_channels);
        assert!(!caps.can_manage());
    }

    #[test]
    fn test_error_mapping() {
        let err = error_for_status(StatusCode::NOT_FOUND, r#"{"message":"Unknown Channel","code":10003}"#);
        assert!(matches!(err, PlatformError::NotFound(ref m) if m == "Unknown Channel"));
        let err = error_for_status(StatusCode::TOO_MANY_REQUESTS, r#"{"retry_after":2.5}"#);
        assert!(matches!(err, PlatformError::RateLimited { retry_after_secs } if retry_after_secs == 2.5));
        let err = error_for_status(StatusCode::BAD_GATEWAY, "upstream");
        assert!(matches!(err, PlatformError::Api { status: 502, ref message } if message == "upstream"));
    }

    const MOCK_GUILD_COUNT: usize = 450;

    #[derive(Clone, Default)]
    struct MockState {
        create_calls: Arc<AtomicUsize>,
        patch_calls: Arc<AtomicUsize>,
        guild_pages: Arc<AtomicUsize>,
    }

    async fn get_channel(Path(id): Path<String>) -> (AxumStatus, Json<serde_json::Value>) {
        match id.as_str() {
            "10" => (
                AxumStatus::OK,
                Json(json!({
                    "id": "10", "type": 2, "guild_id": "g1", "name": "Price: $1.0000",
                    "parent_id": "9", "position": 0,
                    "permission_overwrites": [{"id": "g1", "type": 0, "allow": "0", "deny": "1048576"}]
                })),
            ),
            "11" => (
                AxumStatus::OK,
                Json(json!({ "id": "11", "type": 2, "guild_id": "other", "name": "x", "position": 0 })),
            ),
            _ => (
                AxumStatus::NOT_FOUND,
                Json(json!({ "message": "Unknown Channel", "code": 10003 })),
            ),
        }
    }

    async fn create_channel(
        State(state): State<MockState>,
        Path(guild_id): Path<String>,
        Json(body): Json<serde_json::Value>,
    ) -> (AxumStatus, Json<serde_json::Value>) {
        // First attempt is rate limited
        if state.create_calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return (AxumStatus::TOO_MANY_REQUESTS, Json(json!({ "retry_after": 0.01 })));
        }
        (
            AxumStatus::CREATED,
            Json(json!({
                "id": "42", "type": body["type"], "guild_id": guild_id, "name": body["name"],
                "parent_id": body.get("parent_id"), "position": body["position"],
                "permission_overwrites": body["permission_overwrites"]
            })),
        )
    }

    /// "slow" asks for a wait beyond the cap; any other id stays rate limited.
    async fn patch_channel(
        State(state): State<MockState>,
        Path(id): Path<String>,
    ) -> (AxumStatus, Json<serde_json::Value>) {
        state.patch_calls.fetch_add(1, Ordering::SeqCst);
        let retry_after = if id == "slow" { 60.0 } else { 0.01 };
        (AxumStatus::TOO_MANY_REQUESTS, Json(json!({ "retry_after": retry_after })))
    }

    async fn current_user() -> Json<serde_json::Value> {
        Json(json!({ "id": "bot" }))
    }

    async fn current_user_guilds(
        State(state): State<MockState>,
        Query(params): Query<HashMap<String, String>>,
    ) -> Json<serde_json::Value> {
        state.guild_pages.fetch_add(1, Ordering::SeqCst);
        let limit: usize = params.get("limit").and_then(|v| v.parse().ok()).unwrap_or(200);
        let start = params
            .get("after")
            .and_then(|v| v.parse::<usize>().ok())
            .map_or(0, |after| after + 1);
        let end = (start + limit).min(MOCK_GUILD_COUNT);
        let page: Vec<serde_json::Value> = (start..end).map(|i| json!({ "id": i.to_string() })).collect();
        Json(json!(page))
    }

    async fn guild_member(Path((guild_id, user_id)): Path<(String, String)>) -> (AxumStatus, Json<serde_json::Value>) {
        assert_eq!(user_id, "bot");
        if guild_id == "gone" {
            return (AxumStatus::FORBIDDEN, Json(json!({ "message": "Missing Access", "code": 50001 })));
        }
        (AxumStatus::OK, Json(json!({ "roles": ["r-manage"] })))
    }

    async fn guild_roles(Path(guild_id): Path<String>) -> Json<serde_json::Value> {
        Json(json!([
            { "id": guild_id, "permissions": "0", "position": 0 },
            { "id": "r-manage", "permissions": PERMISSION_MANAGE_CHANNELS.to_string(), "position": 3 },
        ]))
    }

    async fn spawn_mock() -> (String, MockState) {
        let state = MockState::default();
        let app = Router::new()
            .route("/channels/:id", get(get_channel).patch(patch_channel))
            .route("/guilds/:guild_id/channels", post(create_channel))
            .route("/guilds/:guild_id/members/:user_id", get(guild_member))
            .route("/guilds/:guild_id/roles", get(guild_roles))
            .route("/users/@me", get(current_user))
            .route("/users/@me/guilds", get(current_user_guilds))
            .with_state(state.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app.into_make_service()).await.ok();
        });
        (format!("http://{}", addr), state)
    }

    #[tokio::test]
    async fn test_fetch_and_create_against_mock_api() {
        let (base, state) = spawn_mock().await;
        let platform = DiscordPlatform::new(&base, "token", Duration::from_secs(5)).expect("client");

        let channel = platform.fetch_channel("g1", "10").await.unwrap().expect("live channel");
        assert_eq!(channel.kind, ChannelKind::Voice);
        assert_eq!(channel.parent_id.as_deref(), Some("9"));
        assert_eq!(channel.overwrites, vec![PermissionOverwrite::deny_connect_everyone("g1")]);

        // Wrong guild and unknown ids both resolve to nothing
        assert!(platform.fetch_channel("g1", "11").await.unwrap().is_none());
        assert!(platform.fetch_channel("g1", "404").await.unwrap().is_none());

        let created = platform
            .create_channel(
                "g1",
                NewChannel {
                    name: "Halving Stats".to_string(),
                    kind: ChannelKind::Category,
                    parent_id: None,
                    position: 0,
                    overwrites: vec![],
                },
            )
            .await
            .expect("create after rate limit retry");
        assert_eq!(created.id, "42");
        assert_eq!(created.kind, ChannelKind::Category);
        assert_eq!(created.parent_id, None);
        assert_eq!(state.create_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_rate_limit_beyond_cap_or_retries_surfaces() {
        let (base, state) = spawn_mock().await;
        let platform = DiscordPlatform::new(&base, "token", Duration::from_secs(5)).expect("client");

        // 60s requested against the default 30s cap: no wait, no retry
        let err = platform.rename_channel("g1", "slow", "x").await.expect_err("rate limited");
        assert!(matches!(err, PlatformError::RateLimited { retry_after_secs } if retry_after_secs == 60.0));
        assert_eq!(state.patch_calls.load(Ordering::SeqCst), 1);

        // Short waits are honoured until the retry budget runs out
        let err = platform.rename_channel("g1", "busy", "x").await.expect_err("rate limited");
        assert!(matches!(err, PlatformError::RateLimited { .. }));
        assert_eq!(
            state.patch_calls.load(Ordering::SeqCst),
            1 + 1 + MAX_RATE_LIMIT_RETRIES as usize
        );

        // A cap below even the short wait fails on the first response
        let capped = DiscordPlatform::new(&base, "token", Duration::from_secs(5))
            .expect("client")
            .with_max_rate_limit_wait(Duration::from_millis(1));
        let err = capped.rename_channel("g1", "busy", "x").await.expect_err("rate limited");
        assert!(matches!(err, PlatformError::RateLimited { .. }));
        assert_eq!(
            state.patch_calls.load(Ordering::SeqCst),
            1 + 1 + MAX_RATE_LIMIT_RETRIES as usize + 1
        );
    }

    #[tokio::test]
    async fn test_member_lookup_denied_means_guild_gone() {
        let (base, _state) = spawn_mock().await;
        let platform = Arc::new(DiscordPlatform::new(&base, "token", Duration::from_secs(5)).expect("client"));

        let caps = platform.capabilities("g1").await.expect("capabilities");
        assert_eq!(caps, Capabilities { manage_channels: true, top_role_position: 3 });

        let err = platform.capabilities("gone").await.expect_err("left guild");
        assert!(err.is_not_found());

        let reconciler = Reconciler::new(
            platform,
            Storage::temporary().expect("storage"),
            ReconcilerSettings::default(),
        );
        assert_eq!(
            reconciler.reconcile("gone", &DesiredState::default()).await,
            ReconcileOutcome::TenantGone
        );
    }

    #[tokio::test]
    async fn test_list_guilds_follows_pages() {
        let (base, state) = spawn_mock().await;
        let platform = DiscordPlatform::new(&base, "token", Duration::from_secs(5)).expect("client");

        let guilds = platform.list_guilds().await.expect("guilds");
        assert_eq!(guilds.len(), MOCK_GUILD_COUNT);
        assert_eq!(guilds.first().map(String::as_str), Some("0"));
        assert_eq!(guilds.last().map(String::as_str), Some("449"));
        // 200 + 200 + 50
        assert_eq!(state.guild_pages.load(Ordering::SeqCst), 3);
    }
}
