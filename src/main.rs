use std::collections::HashMap;
use std::sync::Arc;

use rmcp::{
    ErrorData as McpError, RoleServer, ServerHandler, ServiceExt, model::*,
    service::RequestContext,
};
use rmcp::model::ContentBlock as Content;
use schemars::{JsonSchema, SchemaGenerator};
use serde::{Deserialize, Serialize};

// schema_for_type using schemars 0.9 with JSON Schema draft 2020-12 settings
fn schema_for_type<T: JsonSchema>() -> serde_json::Map<String, serde_json::Value> {
    let schema = SchemaGenerator::default().into_root_schema_for::<T>();
    let object = serde_json::to_value(schema).expect("failed to serialize schema");
    match object {
        serde_json::Value::Object(object) => object,
        _ => panic!("unexpected schema value"),
    }
}
use chrono::{DateTime, Utc};
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use reqwest::Client;
use rmcp::transport::stdio;
use serde_json::json;
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// Core Configuration
// =============================================================================

use url::Url;

#[derive(Debug)]
pub struct HomeAssistantConfig {
    pub url: String,
    pub token: String,
}

impl HomeAssistantConfig {
    pub fn new(url: String, token: String) -> Self {
        Self { url, token }
    }

    /// Resolve configuration from explicit values with an environment
    /// snapshot as fallback. Explicit values always win.
    pub fn resolve(
        url: Option<String>,
        token: Option<String>,
        env: &HashMap<String, String>,
    ) -> Result<Self, HaError> {
        let url = url
            .or_else(|| env.get("HA_API_URL").cloned())
            .filter(|u| !u.is_empty())
            .ok_or_else(|| {
                HaError::Config("no Home Assistant URL given and HA_API_URL is unset".into())
            })?;
        Url::parse(&url)
            .map_err(|e| HaError::Config(format!("invalid Home Assistant URL '{}': {}", url, e)))?;
        let token = token
            .or_else(|| env.get("HA_API_KEY").cloned())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                HaError::Config("no Home Assistant token given and HA_API_KEY is unset".into())
            })?;
        Ok(Self { url, token })
    }

    pub fn websocket_url(&self) -> String {
        let mut url = Url::parse(&self.url).expect("Invalid URL");
        let new_scheme = match url.scheme() {
            "https" => "wss",
            _ => "ws",
        };
        url.set_scheme(new_scheme).unwrap(); // ws and wss are always valid schemes
        let path = format!("{}/websocket", url.path().trim_end_matches('/'));
        url.set_path(&path);
        url.to_string()
    }
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum HaError {
    /// The REST API answered with anything other than 200.
    #[error("request failed with status {status}")]
    RequestFailed { status: u16 },

    /// The socket closed before the service call settled.
    #[error("websocket connection closed before a result was received")]
    ConnectionClosed,

    /// Home Assistant rejected the access token during the handshake.
    #[error("websocket authentication failed")]
    AuthenticationFailed,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("missing argument '{0}' for this command")]
    MissingArgument(&'static str),

    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("websocket transport error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<HaError> for McpError {
    fn from(err: HaError) -> Self {
        McpError::internal_error(err.to_string(), None)
    }
}

// =============================================================================
// Service Invocation Protocol
// =============================================================================

/// Error code Home Assistant reports when a call requesting an inline
/// response hits a service that cannot produce one. The one retriable class.
const SERVICE_VALIDATION_ERROR: &str = "service_validation_error";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Authenticating,
    AwaitingResult,
    AwaitingRetryResult,
}

/// One service invocation over one socket. Opens, authenticates, sends the
/// call, interprets the result and retries at most once, then closes.
struct ServiceCallSession {
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    state: SessionState,
    request_id: u64,
    retried: bool,
}

/// Everything needed to (re)build a `call_service` frame. The retry sends
/// the same call under a new id with the inline-response flag dropped.
struct ServiceCall<'a> {
    domain: &'a str,
    service: &'a str,
    entity_id: &'a str,
    data: Option<&'a serde_json::Value>,
}

impl<'a> ServiceCall<'a> {
    fn frame(&self, id: u64, return_response: bool) -> serde_json::Value {
        let mut frame = json!({
            "id": id,
            "type": "call_service",
            "domain": self.domain,
            "service": self.service,
            "target": { "entity_id": self.entity_id },
        });
        if let Some(data) = self.data {
            frame["service_data"] = data.clone();
        }
        if return_response {
            frame["return_response"] = json!(true);
        }
        frame
    }
}

impl ServiceCallSession {
    async fn connect(config: &HomeAssistantConfig) -> Result<Self, HaError> {
        let (ws_stream, _) = connect_async(config.websocket_url()).await?;
        Ok(Self {
            ws_stream,
            state: SessionState::Authenticating,
            request_id: 0,
            retried: false,
        })
    }

    async fn send_frame(&mut self, frame: serde_json::Value) -> Result<(), HaError> {
        self.ws_stream
            .send(Message::Text(frame.to_string().into()))
            .await?;
        Ok(())
    }

    /// Drive the session state machine to settlement.
    ///
    /// Application-level failures settle successfully with the raw failure
    /// frame as the result string; only a premature socket close rejects.
    async fn run(&mut self, token: &str, call: ServiceCall<'_>) -> Result<String, HaError> {
        self.send_frame(json!({ "type": "auth", "access_token": token }))
            .await?;

        while let Some(msg) = self.ws_stream.next().await {
            let msg = msg?;
            let Message::Text(text) = msg else {
                continue;
            };
            let Ok(frame) = serde_json::from_str::<serde_json::Value>(&text) else {
                continue;
            };
            let frame_type = frame.get("type").and_then(|t| t.as_str());

            match (self.state, frame_type) {
                (SessionState::Authenticating, Some("auth_ok")) => {
                    tracing::debug!(domain = call.domain, service = call.service, "authenticated");
                    self.request_id = 1;
                    self.send_frame(call.frame(self.request_id, true)).await?;
                    self.state = SessionState::AwaitingResult;
                }
                (SessionState::Authenticating, Some("auth_invalid")) => {
                    return Err(HaError::AuthenticationFailed);
                }
                (
                    SessionState::AwaitingResult | SessionState::AwaitingRetryResult,
                    Some("result"),
                ) => {
                    if frame.get("id").and_then(|v| v.as_u64()) != Some(self.request_id) {
                        continue;
                    }
                    if frame.get("success").and_then(|v| v.as_bool()) == Some(true) {
                        let response = frame
                            .pointer("/result/response")
                            .filter(|v| !v.is_null());
                        return Ok(match response {
                            Some(response) => response.to_string(),
                            None => "done".to_string(),
                        });
                    }

                    let code = frame.pointer("/error/code").and_then(|c| c.as_str());
                    if code == Some(SERVICE_VALIDATION_ERROR) && !self.retried {
                        tracing::debug!(
                            domain = call.domain,
                            service = call.service,
                            "validation failure, retrying without inline response"
                        );
                        self.retried = true;
                        self.request_id = 2;
                        self.send_frame(call.frame(self.request_id, false)).await?;
                        self.state = SessionState::AwaitingRetryResult;
                        continue;
                    }
                    return Ok(frame.to_string());
                }
                // auth_required, pongs, unrelated pushes
                _ => {}
            }
        }

        Err(HaError::ConnectionClosed)
    }

    async fn close(mut self) {
        let _ = self.ws_stream.close(None).await;
    }
}

// =============================================================================
// Home Assistant API Client
// =============================================================================

pub struct HomeAssistantClient {
    config: HomeAssistantConfig,
    http_client: Client,
}

impl HomeAssistantClient {
    pub fn new(config: HomeAssistantConfig) -> Self {
        Self {
            config,
            http_client: Client::new(),
        }
    }

    /// Invoke a service on an entity over the websocket API.
    pub async fn call_service(
        &self,
        domain: &str,
        service: &str,
        entity_id: &str,
        data: Option<&serde_json::Value>,
    ) -> Result<String, HaError> {
        let mut session = ServiceCallSession::connect(&self.config).await?;
        let outcome = session
            .run(
                &self.config.token,
                ServiceCall {
                    domain,
                    service,
                    entity_id,
                    data,
                },
            )
            .await;
        session.close().await;
        outcome
    }

    async fn rest_get(&self, path: &str) -> Result<String, HaError> {
        let url = if path.is_empty() {
            self.config.url.clone()
        } else {
            format!("{}/{}", self.config.url.trim_end_matches('/'), path)
        };

        let response = self
            .http_client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.config.token))
            .header("Content-Type", "application/json")
            .send()
            .await?;

        let status = response.status();
        tracing::debug!(%url, %status, "REST GET");
        if status != reqwest::StatusCode::OK {
            return Err(HaError::RequestFailed {
                status: status.as_u16(),
            });
        }

        Ok(response.text().await?)
    }

    /// Ping the API root to confirm the controller is up.
    pub async fn check_api(&self) -> Result<String, HaError> {
        self.rest_get("").await
    }

    /// Query entity state. With a full `domain.entity` id this returns the
    /// raw state object; with a domain alone it returns a reduced listing of
    /// every entity in that domain; with neither it returns all states.
    pub async fn query_state(
        &self,
        domain: Option<&str>,
        entity: Option<&str>,
    ) -> Result<String, HaError> {
        let (domain, entity) = split_entity_id(domain, entity);
        match (domain.as_deref(), entity.as_deref()) {
            (Some(domain), Some(entity)) => {
                self.rest_get(&format!("states/{}.{}", domain, entity)).await
            }
            (Some(domain), None) => {
                let body = self.rest_get("states").await?;
                let states: Vec<EntityStateSummary> = serde_json::from_str(&body)?;
                let prefix = format!("{}.", domain);
                let filtered: Vec<EntityStateSummary> = states
                    .into_iter()
                    .filter(|s| s.entity_id.starts_with(&prefix))
                    .collect();
                Ok(serde_json::to_string(&filtered)?)
            }
            _ => self.rest_get("states").await,
        }
    }

    /// Query the service catalog, optionally reduced to one domain's entry.
    pub async fn query_services(&self, domain: Option<&str>) -> Result<String, HaError> {
        let body = self.rest_get("services").await?;
        let Some(domain) = domain else {
            return Ok(body);
        };

        let catalog: serde_json::Value = serde_json::from_str(&body)?;
        let empty_vec = vec![];
        let filtered: Vec<&serde_json::Value> = catalog
            .as_array()
            .unwrap_or(&empty_vec)
            .iter()
            .filter(|entry| entry.get("domain").and_then(|d| d.as_str()) == Some(domain))
            .collect();
        Ok(serde_json::to_string(&filtered)?)
    }
}

/// Reduced per-entity record returned by domain-filtered state queries.
#[derive(Debug, Serialize, Deserialize)]
struct EntityStateSummary {
    entity_id: String,
    state: String,
    last_changed: DateTime<Utc>,
}

/// Accept entity ids in either shape: a bare name next to a domain, or a
/// full `domain.name` id with no separate domain.
fn split_entity_id(
    domain: Option<&str>,
    entity: Option<&str>,
) -> (Option<String>, Option<String>) {
    match (domain, entity) {
        (None, Some(entity)) if entity.contains('.') => {
            let mut parts = entity.splitn(2, '.');
            let domain = parts.next().map(|s| s.to_string());
            let entity = parts.next().map(|s| s.to_string());
            (domain, entity)
        }
        _ => (
            domain.map(|s| s.to_string()),
            entity.map(|s| s.to_string()),
        ),
    }
}

// =============================================================================
// Tool Schema & Dispatch
// =============================================================================

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct HomeAssistantArgs {
    /// The command type to run, one of checkAPI, queryState, queryService, callService
    pub command: String,
    /// The domain of the entity (e.g. light, switch)
    #[serde(default)]
    pub domain: Option<String>,
    /// The entity to interact with, either the full entity ID (e.g. domain.entity) or the bare name with the domain passed separately
    #[serde(default)]
    pub entity: Option<String>,
    /// The service to call on the domain (e.g. turn_on)
    #[serde(default)]
    pub service: Option<String>,
    /// Service data forwarded with a callService command (JSON object)
    #[serde(default)]
    #[schemars(with = "Option<std::collections::HashMap<String, serde_json::Value>>")]
    pub data: Option<serde_json::Value>,
}

pub struct HomeAssistantService {
    client: HomeAssistantClient,
}

impl HomeAssistantService {
    pub fn new(config: HomeAssistantConfig) -> Self {
        tracing::info!("Created Home Assistant tool with URL: {}", config.url);
        Self {
            client: HomeAssistantClient::new(config),
        }
    }

    async fn dispatch(&self, args: HomeAssistantArgs) -> Result<String, HaError> {
        tracing::debug!(command = %args.command, "dispatching Home Assistant command");
        match args.command.as_str() {
            "checkAPI" => self.client.check_api().await,
            "queryState" => {
                self.client
                    .query_state(args.domain.as_deref(), args.entity.as_deref())
                    .await
            }
            "queryService" => self.client.query_services(args.domain.as_deref()).await,
            "callService" => {
                let (domain, entity) =
                    split_entity_id(args.domain.as_deref(), args.entity.as_deref());
                let domain = domain.ok_or(HaError::MissingArgument("domain"))?;
                let entity = entity.ok_or(HaError::MissingArgument("entity"))?;
                let service = args
                    .service
                    .as_deref()
                    .ok_or(HaError::MissingArgument("service"))?;
                let entity_id = format!("{}.{}", domain, entity);
                self.client
                    .call_service(&domain, service, &entity_id, args.data.as_ref())
                    .await
            }
            _ => Ok("Command not recognised".to_string()),
        }
    }
}

impl ServerHandler for HomeAssistantService {
    fn get_info(&self) -> ServerInfo {
        ServerInfo::new(ServerCapabilities::builder().enable_tools().build())
            .with_protocol_version(ProtocolVersion::V_2024_11_05)
            .with_server_info(Implementation::from_build_env())
            .with_instructions("This server can query and control Home Assistant entities.")
    }

    async fn initialize(
        &self,
        _request: InitializeRequestParams,
        context: RequestContext<RoleServer>,
    ) -> Result<InitializeResult, McpError> {
        if let Some(http_request_part) = context.extensions.get::<axum::http::request::Parts>() {
            let initialize_headers = &http_request_part.headers;
            let initialize_uri = &http_request_part.uri;
            tracing::info!(?initialize_headers, %initialize_uri, "initialize from http server");
        }
        Ok(self.get_info())
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        let tools = vec![Tool::new(
            "home_assistant",
            "Query and control Home Assistant entities. Pass a command, one of: \
             checkAPI to check the API is available and running; \
             queryState with no other parameters for all entities, with a domain for a \
             reduced list of that domain's entities, or with a domain and entity for \
             full details of one entity; \
             queryService with a domain to list the services available for it; \
             callService with a domain, service name, entity and correct data.",
            Arc::new(schema_for_type::<HomeAssistantArgs>()),
        )];

        Ok(ListToolsResult::with_all_items(tools))
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResponse, McpError> {
        let arguments = request.arguments.unwrap_or_default();

        match request.name.as_ref() {
            "home_assistant" => {
                let args: HomeAssistantArgs = serde_json::from_value(serde_json::Value::Object(arguments))
                    .map_err(|e| McpError::invalid_params(
                        format!("home_assistant: Invalid arguments - {}. Expected: {{\"command\": \"checkAPI|queryState|queryService|callService\", \"domain\": \"string (optional)\", \"entity\": \"string (optional)\", \"service\": \"string (optional)\", \"data\": object (optional)}}", e),
                        None
                    ))?;
                let text = self.dispatch(args).await?;
                Ok(CallToolResult::success(vec![Content::text(text)]).into())
            }
            unknown_tool => Err(McpError::invalid_params(
                format!(
                    "Unknown tool: '{}'. Available tools: home_assistant",
                    unknown_tool
                ),
                None,
            )),
        }
    }
}

#[derive(Parser)]
#[command(name = "ha-tool")]
#[command(about = "Home Assistant MCP Tool Server")]
#[command(version = "0.1.0")]
struct Cli {
    /// Home Assistant API URL (e.g. http://localhost:8123/api)
    #[arg(long = "url", env = "HA_API_URL")]
    url: Option<String>,

    /// Home Assistant long-lived access token
    #[arg(long = "api-key", env = "HA_API_KEY")]
    api_key: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let env: HashMap<String, String> = std::env::vars().collect();
    let config = HomeAssistantConfig::resolve(cli.url, cli.api_key, &env)?;

    tracing::info!("🚀 Home Assistant tool server starting");
    tracing::info!("📡 Home Assistant URL: {}", config.url);

    let service = HomeAssistantService::new(config);

    let server_service = service
        .serve(stdio())
        .await
        .inspect_err(|error| tracing::error!(%error, "Error serving"))?;

    server_service.waiting().await?;

    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
