use std::{convert::TryFrom, sync::Arc};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use log::debug;
use reqwest::{Client, Method, StatusCode};
use serde_json::{json, Value as JsonValue};

use super::gateway::GatewaySession;
use super::{Guild, Platform, Session, ShardInfo};
use crate::datasources::RATE_LIMITED;

const API_BASE: &str = "https://discord.com/api/v10";
const GATEWAY_URL: &str = "wss://gateway.discord.gg";

pub const GREEN_ROLE: &str = "tickers-green";
pub const RED_ROLE: &str = "tickers-red";

pub struct DiscordPlatform {
    client: Arc<Client>,
    token: String,
    label: String,
}

impl DiscordPlatform {
    pub fn new(client: Arc<Client>, token: String, label: String) -> DiscordPlatform {
        DiscordPlatform {
            client,
            token,
            label,
        }
    }

    async fn request(&self, method: Method, path: &str, body: Option<JsonValue>) -> Result<JsonValue> {
        let mut request = self
            .client
            .request(method.clone(), &format!("{}{}", API_BASE, path))
            .header("Authorization", format!("Bot {}", self.token));
        if let Some(body) = body {
            request = request.json(&body);
        }
        let resp_payload = request.send().await?;
        let status = resp_payload.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(anyhow!("Discord: {} on {} {}", RATE_LIMITED, method, path));
        }
        if status == StatusCode::NO_CONTENT {
            return Ok(JsonValue::Null);
        }
        let response: JsonValue = resp_payload.json().await?;
        debug!("Discord: {} {} {} {}", method, path, status, response);
        if !status.is_success() {
            return Err(anyhow!(
                "Discord: {} {} failed with {}: {}",
                method,
                path,
                status,
                response["message"]
            ));
        }
        Ok(response)
    }
}

/// Finds the (wanted, unwanted) role ids for the price direction.
fn color_roles(roles: &JsonValue, increase: bool) -> Result<(String, Option<String>)> {
    let find = |name: &str| {
        roles.as_array().and_then(|roles| {
            roles
                .iter()
                .find(|role| role["name"].as_str() == Some(name))
                .and_then(|role| role["id"].as_str())
                .map(str::to_owned)
        })
    };
    let (wanted, unwanted) = if increase {
        (GREEN_ROLE, RED_ROLE)
    } else {
        (RED_ROLE, GREEN_ROLE)
    };
    let wanted = find(wanted).ok_or(anyhow!("missing role {}", wanted))?;
    Ok((wanted, find(unwanted)))
}

fn recommended_shards(response: &JsonValue) -> Result<u32> {
    let shards = response["shards"]
        .as_u64()
        .ok_or(anyhow!("Failed to parse Discord gateway response"))?;
    u32::try_from(shards.max(1)).context("shard count out of range")
}

#[async_trait]
impl Platform for DiscordPlatform {
    async fn open_session(&self, shard: Option<ShardInfo>) -> Result<Box<dyn Session>> {
        let session = GatewaySession::connect(GATEWAY_URL, &self.token, shard, &self.label)
            .await
            .with_context(|| format!("opening gateway for {}", self.label))?;
        Ok(Box::new(session))
    }

    async fn shard_count(&self) -> Result<u32> {
        recommended_shards(&self.request(Method::GET, "/gateway/bot", None).await?)
    }

    async fn guilds(&self) -> Result<Vec<Guild>> {
        let response = self
            .request(Method::GET, "/users/@me/guilds?limit=100", None)
            .await?;
        Ok(serde_json::from_value(response)?)
    }

    async fn set_nickname(&self, guild_id: &str, nickname: &str) -> Result<()> {
        self.request(
            Method::PATCH,
            &format!("/guilds/{}/members/@me", guild_id),
            Some(json!({ "nick": nickname })),
        )
        .await?;
        Ok(())
    }

    async fn set_color_role(&self, guild_id: &str, user_id: &str, increase: bool) -> Result<()> {
        if user_id.is_empty() {
            bail!("client_id is required for color roles");
        }
        let roles = self
            .request(Method::GET, &format!("/guilds/{}/roles", guild_id), None)
            .await?;
        let (wanted, unwanted) = color_roles(&roles, increase)?;
        let member_roles = format!("/guilds/{}/members/{}/roles", guild_id, user_id);
        self.request(Method::PUT, &format!("{}/{}", member_roles, wanted), None)
            .await?;
        if let Some(unwanted) = unwanted {
            self.request(Method::DELETE, &format!("{}/{}", member_roles, unwanted), None)
                .await?;
        }
        Ok(())
    }

    async fn set_username(&self, name: &str) -> Result<()> {
        self.request(Method::PATCH, "/users/@me", Some(json!({ "username": name })))
            .await?;
        Ok(())
    }
}
