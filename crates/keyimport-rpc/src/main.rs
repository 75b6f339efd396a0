use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use keyimport::prelude::*;
use keyimport::{decrypt_compact, encrypt_compact};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::prelude::__tracing_subscriber_SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// --- Struct Definitions ---
#[derive(Deserialize, Serialize, Clone, Debug)]
struct RpcRequest {
    jsonrpc: String,
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Serialize, Debug)]
struct RpcResponse {
    jsonrpc: String,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

#[derive(Serialize, Debug)]
struct RpcError {
    code: i32,
    message: String,
}

#[derive(Deserialize, Debug, Default)]
struct RunParams {
    /// Message the server encrypts for verification
    message: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
struct UsageParams {
    server_message: Option<String>,
    client_message: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ServerWrapParams {
    jwk: String,
    key_size_bits: Option<usize>,
}

#[derive(Deserialize, Debug)]
struct JweEncryptParams {
    key: String, // Base64 encoded AES key
    plaintext: String,
}

#[derive(Deserialize, Debug)]
struct JweDecryptParams {
    key: String, // Base64 encoded AES key
    jwe: String,
}
// --- Struct Definitions End ---

#[derive(Debug, Error)]
enum MethodError {
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("{0}")]
    Internal(String),
}

impl MethodError {
    fn code(&self) -> i32 {
        match self {
            MethodError::InvalidParams(_) => -32602,
            MethodError::Internal(_) => -32000,
        }
    }
}

impl From<KeyImportError> for MethodError {
    fn from(e: KeyImportError) -> Self {
        if e.is_invalid_argument() {
            MethodError::InvalidParams(e.to_string())
        } else {
            MethodError::Internal(e.to_string())
        }
    }
}

/// Everything a request handler needs
struct Service {
    orchestrator: Arc<Orchestrator>,
    runner: ProtocolRunner,
    server: KeyWrapServer,
}

impl Service {
    fn new(orchestrator: Orchestrator) -> Self {
        let orchestrator = Arc::new(orchestrator);
        Service {
            runner: ProtocolRunner::new(Arc::clone(&orchestrator)),
            orchestrator,
            server: KeyWrapServer::new(),
        }
    }

    fn config(&self) -> &ProtocolConfig {
        self.orchestrator.config()
    }
}

// --- Helper Functions ---
fn create_error_response(id: Value, code: i32, message: String) -> RpcResponse {
    error!("Responding with error: code={}, message={}", code, message);
    RpcResponse {
        jsonrpc: "2.0".to_string(),
        id,
        result: None,
        error: Some(RpcError { code, message }),
    }
}

fn create_success_response(id: Value, result: Value) -> RpcResponse {
    RpcResponse {
        jsonrpc: "2.0".to_string(),
        id,
        result: Some(result),
        error: None,
    }
}

fn parse_params<T: DeserializeOwned>(params: Value, method: &str) -> Result<T, MethodError> {
    serde_json::from_value(params)
        .map_err(|e| MethodError::InvalidParams(format!("{} ({})", e, method)))
}

/// Missing or null params fall back to the defaults
fn parse_optional_params<T: DeserializeOwned + Default>(
    params: Value,
    method: &str,
) -> Result<T, MethodError> {
    if params.is_null() {
        return Ok(T::default());
    }
    parse_params(params, method)
}

fn decode_key(encoded: &str) -> Result<Vec<u8>, MethodError> {
    BASE64
        .decode(encoded)
        .map_err(|e| MethodError::InvalidParams(format!("Invalid base64 key: {}", e)))
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, MethodError> {
    serde_json::to_value(value).map_err(|e| MethodError::Internal(e.to_string()))
}

fn run_to_json(run: &ProtocolRun) -> Result<Value, MethodError> {
    let transitions = to_value(&run.transitions)?;
    let outcome = match &run.outcome {
        ProtocolOutcome::UsageVerified(report) => json!({
            "status": run.outcome.kind(),
            "report": to_value(report)?,
        }),
        ProtocolOutcome::UnsupportedPlatform {
            api_level,
            required,
        } => json!({
            "status": run.outcome.kind(),
            "api_level": api_level,
            "required": required,
        }),
        ProtocolOutcome::ImportUnavailable => json!({ "status": run.outcome.kind() }),
        ProtocolOutcome::VerificationMismatch { check } => json!({
            "status": run.outcome.kind(),
            "check": to_value(check)?,
        }),
        ProtocolOutcome::Failed { phase, cause } => json!({
            "status": run.outcome.kind(),
            "phase": to_value(phase)?,
            "cause": cause.to_string(),
            "suggestion": cause.suggestion(),
        }),
    };
    Ok(json!({ "outcome": outcome, "transitions": transitions }))
}

fn usage_to_json(outcome: &UsageOutcome) -> Result<Value, MethodError> {
    Ok(match outcome {
        UsageOutcome::Success {
            level,
            server_to_client,
            client_to_server,
        } => json!({
            "status": "success",
            "security_level": to_value(level)?,
            "server_to_client": server_to_client,
            "client_to_server": client_to_server,
        }),
        UsageOutcome::NoSuchKey => json!({ "status": "no_such_key" }),
        UsageOutcome::Mismatch { check } => json!({
            "status": "mismatch",
            "check": to_value(check)?,
        }),
        UsageOutcome::Failed { cause } => json!({
            "status": "failed",
            "cause": cause.to_string(),
        }),
    })
}

fn local_usage_to_json(outcome: &LocalUsageOutcome) -> Value {
    match outcome {
        LocalUsageOutcome::Success { message } => json!({ "status": "success", "message": message }),
        LocalUsageOutcome::NoSuchKey => json!({ "status": "no_such_key" }),
        LocalUsageOutcome::Mismatch => json!({ "status": "mismatch" }),
        LocalUsageOutcome::Failed { cause } => json!({
            "status": "failed",
            "cause": cause.to_string(),
        }),
    }
}

/// Run blocking keystore work off the reactor
async fn blocking<T, F>(f: F) -> Result<T, MethodError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| MethodError::Internal(format!("Worker failed: {}", e)))
}
// --- Helper Functions End ---

// --- Method Handlers ---
async fn keyimport_run(service: &Service, params: Value) -> Result<Value, MethodError> {
    let p: RunParams = parse_optional_params(params, "keyimport_run")?;
    let message = p.message.unwrap_or_else(default_server_message);
    let run = service
        .runner
        .start(message)
        .await
        .map_err(|_| MethodError::Internal("Run superseded by a newer request".to_string()))?;
    run_to_json(&run)
}

async fn keyimport_usage(service: &Service, params: Value) -> Result<Value, MethodError> {
    let p: UsageParams = parse_optional_params(params, "keyimport_usage")?;
    let server_message = p.server_message.unwrap_or_else(default_server_message);
    let client_message = p.client_message.unwrap_or_else(default_client_message);
    let orchestrator = Arc::clone(&service.orchestrator);
    let outcome =
        blocking(move || orchestrator.run_two_way_usage(&server_message, &client_message)).await?;
    usage_to_json(&outcome)
}

async fn keyimport_local_usage(service: &Service, params: Value) -> Result<Value, MethodError> {
    let p: RunParams = parse_optional_params(params, "keyimport_local_usage")?;
    let message = p.message.unwrap_or_else(default_client_message);
    let orchestrator = Arc::clone(&service.orchestrator);
    let outcome = blocking(move || orchestrator.run_local_usage(&message)).await?;
    Ok(local_usage_to_json(&outcome))
}

async fn wrapping_key_usage(service: &Service, params: Value) -> Result<Value, MethodError> {
    let p: RunParams = parse_optional_params(params, "wrapping_key_usage")?;
    let message = p.message.unwrap_or_else(default_client_message);
    let orchestrator = Arc::clone(&service.orchestrator);
    let outcome = blocking(move || orchestrator.run_wrapping_key_usage(&message)).await?;
    Ok(local_usage_to_json(&outcome))
}

async fn server_wrap(service: &Service, params: Value) -> Result<Value, MethodError> {
    let p: ServerWrapParams = parse_params(params, "server_wrap")?;
    let mut config = service.config().clone();
    if let Some(bits) = p.key_size_bits {
        config.tek_size_bits = bits;
    }
    config.validate().map_err(KeyImportError::from)?;

    let server = service.server;
    let output = blocking(move || server.generate_and_wrap(&p.jwk, &config)).await??;
    Ok(json!({
        "wrapped_key": output.wrapped_key,
        "tek": BASE64.encode(output.tek.as_slice()),
        "key_size_bits": output.tek.size_bits(),
    }))
}

fn jwe_encrypt(params: Value) -> Result<Value, MethodError> {
    let p: JweEncryptParams = parse_params(params, "jwe_encrypt")?;
    let key = decode_key(&p.key)?;
    let compact =
        encrypt_compact(p.plaintext.as_bytes(), &key).map_err(KeyImportError::from)?;
    Ok(json!({ "jwe": compact }))
}

fn jwe_decrypt(params: Value) -> Result<Value, MethodError> {
    let p: JweDecryptParams = parse_params(params, "jwe_decrypt")?;
    let key = decode_key(&p.key)?;
    let plaintext = decrypt_compact(&p.jwe, &key).map_err(KeyImportError::from)?;
    Ok(json!({
        "plaintext": String::from_utf8(plaintext.clone()).ok(),
        "plaintext_base64": BASE64.encode(&plaintext),
    }))
}
// --- Method Handlers End ---

fn help() -> Value {
    json!({
        "message": "Key import server: drives the secure key import protocol over JSON-RPC.",
        "commands": {
            "help": { "description": "Displays this help message." },
            "keyimport_run": { "description": "Runs the full key import protocol.", "params": { "message": "optional string" } },
            "keyimport_usage": { "description": "Two-way JWE test against the imported key.", "params": { "server_message": "optional string", "client_message": "optional string" } },
            "keyimport_local_usage": { "description": "Client-only encrypt/decrypt with the imported key.", "params": { "message": "optional string" } },
            "wrapping_key_usage": { "description": "RSA-OAEP round-trip with the wrapping key.", "params": { "message": "optional string" } },
            "server_wrap": { "description": "Wraps a fresh transport key for a JWK.", "params": { "jwk": "string", "key_size_bits": "optional 128|192|256" } },
            "jwe_encrypt": { "description": "JWE compact encryption (dir + AES-GCM).", "params": { "key": "base64", "plaintext": "string" } },
            "jwe_decrypt": { "description": "JWE compact decryption.", "params": { "key": "base64", "jwe": "string" } }
        }
    })
}

type ResponseFuture = Pin<Box<dyn Future<Output = RpcResponse> + Send>>;

// --- Main Request Processor ---
fn process_request(service: Arc<Service>, req: RpcRequest) -> ResponseFuture {
    Box::pin(async move {
        debug!("Processing request: method={}, id={:?}", req.method, req.id);

        if req.jsonrpc != "2.0" {
            return create_error_response(
                req.id,
                -32600,
                "Invalid Request: jsonrpc must be \"2.0\"".to_string(),
            );
        }

        let result = match req.method.as_str() {
            "help" => Ok(help()),
            "keyimport_run" => keyimport_run(&service, req.params).await,
            "keyimport_usage" => keyimport_usage(&service, req.params).await,
            "keyimport_local_usage" => keyimport_local_usage(&service, req.params).await,
            "wrapping_key_usage" => wrapping_key_usage(&service, req.params).await,
            "server_wrap" => server_wrap(&service, req.params).await,
            "jwe_encrypt" => jwe_encrypt(req.params),
            "jwe_decrypt" => jwe_decrypt(req.params),
            _ => {
                warn!("Method not found: {}", req.method);
                return create_error_response(
                    req.id,
                    -32601,
                    format!("Method not found: {}", req.method),
                );
            }
        };

        match result {
            Ok(value) => create_success_response(req.id, value),
            Err(e) => create_error_response(req.id, e.code(), e.to_string()),
        }
    })
}

fn tek_storage_path() -> PathBuf {
    match std::env::var("KEYIMPORT_TEK_PATH") {
        Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
        _ => std::env::temp_dir().join("keyimport").join("tek.json"),
    }
}

fn serialize_response(response: &RpcResponse) -> String {
    serde_json::to_string(response).unwrap_or_else(|e| {
        error!("Failed to serialize response for ID {:?}: {}", response.id, e);
        r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32000,"message":"Internal Server Error"}}"#
            .to_string()
    })
}

async fn write_line(stdout: &mut tokio::io::Stdout, line: &str) {
    if let Err(e) = stdout.write_all(format!("{}\r\n", line).as_bytes()).await {
        error!("Failed to write to stdout: {}", e);
    } else if let Err(e) = stdout.flush().await {
        error!("Failed to flush stdout: {}", e);
    }
}

// --- Main Function ---
#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = match ProtocolConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Fatal: invalid configuration: {}", e);
            return;
        }
    };
    let storage_path = tek_storage_path();
    info!(path = %storage_path.display(), "Using transport key storage");

    let service = Arc::new(Service::new(Orchestrator::new(
        Arc::new(SoftwareKeystore::new()),
        Arc::new(StaticPlatform::default()),
        Arc::new(FileTekStorage::new(storage_path)),
        config,
    )));

    info!("Starting key import server on stdio...");
    let stdin = tokio::io::stdin();
    let mut reader = BufReader::new(stdin);
    let mut stdout = tokio::io::stdout();
    let mut line_buffer = String::new();

    let ready = json!({"jsonrpc": "2.0", "method": "server/ready", "params": {"status": "ready"}});
    write_line(&mut stdout, &ready.to_string()).await;

    loop {
        line_buffer.clear();
        match reader.read_line(&mut line_buffer).await {
            Ok(0) => {
                info!("Stdin closed (EOF). Exiting server.");
                break;
            }
            Ok(_) => {
                let trimmed_line = line_buffer.trim();
                if trimmed_line.is_empty() {
                    continue;
                }
                debug!("<<< Received line ({} bytes)", trimmed_line.len());

                let parsed_json: Value = match serde_json::from_str(trimmed_line) {
                    Ok(v) => v,
                    Err(e) => {
                        let resp =
                            create_error_response(Value::Null, -32700, format!("Parse error: {}", e));
                        write_line(&mut stdout, &serialize_response(&resp)).await;
                        continue;
                    }
                };

                // Notifications carry no id and get no response
                if parsed_json.get("id").map_or(true, Value::is_null) {
                    match parsed_json.get("method").and_then(Value::as_str) {
                        Some(method) => info!("Received notification: {}", method),
                        None => warn!("Received notification without method field"),
                    }
                    continue;
                }

                let req: RpcRequest = match serde_json::from_value(parsed_json.clone()) {
                    Ok(r) => r,
                    Err(e) => {
                        let id = parsed_json.get("id").cloned().unwrap_or(Value::Null);
                        let resp = create_error_response(id, -32700, format!("Parse error: {}", e));
                        write_line(&mut stdout, &serialize_response(&resp)).await;
                        continue;
                    }
                };

                let request_id = req.id.clone();
                let request_method = req.method.clone();
                let response = match tokio::time::timeout(
                    REQUEST_TIMEOUT,
                    process_request(Arc::clone(&service), req),
                )
                .await
                {
                    Ok(response) => response,
                    Err(_) => {
                        error!(
                            "Request timed out after {:?} for Method '{}', ID {:?}",
                            REQUEST_TIMEOUT, request_method, request_id
                        );
                        create_error_response(
                            request_id,
                            -32000,
                            format!("Request timed out for method '{}'", request_method),
                        )
                    }
                };
                write_line(&mut stdout, &serialize_response(&response)).await;
            }
            Err(e) => {
                error!("Error reading from stdin: {}. Exiting.", e);
                break;
            }
        }
    }
    info!("Key import server shutting down.");
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyimport::{export_public_key_as_jwk, generate_wrapping_key};

    fn service() -> Arc<Service> {
        let config = ProtocolConfig {
            wrapping_key_bits: 1024,
            ..ProtocolConfig::default()
        };
        Arc::new(Service::new(Orchestrator::new(
            Arc::new(SoftwareKeystore::new()),
            Arc::new(StaticPlatform::new(34)),
            Arc::new(MemoryTekStorage::new()),
            config,
        )))
    }

    fn request(method: &str, params: Value) -> RpcRequest {
        RpcRequest {
            jsonrpc: "2.0".to_string(),
            id: json!(1),
            method: method.to_string(),
            params,
        }
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let resp = process_request(service(), request("nope", Value::Null)).await;
        assert_eq!(resp.error.unwrap().code, -32601);
    }

    #[tokio::test]
    async fn test_run_then_usage() {
        let service = service();
        let resp = process_request(Arc::clone(&service), request("keyimport_run", Value::Null)).await;
        let result = resp.result.unwrap();
        assert_eq!(result["outcome"]["status"], "usage_verified");
        assert_eq!(result["transitions"].as_array().unwrap().len(), 8);

        let resp = process_request(Arc::clone(&service), request("keyimport_usage", json!({}))).await;
        assert_eq!(resp.result.unwrap()["status"], "success");

        let resp = process_request(
            service,
            request("keyimport_local_usage", json!({"message": "local"})),
        )
        .await;
        assert_eq!(resp.result.unwrap()["message"], "local");
    }

    #[tokio::test]
    async fn test_jwe_methods() {
        let key = BASE64.encode([7u8; 16]);
        let resp = process_request(
            service(),
            request("jwe_encrypt", json!({"key": key, "plaintext": "hello"})),
        )
        .await;
        let jwe = resp.result.unwrap()["jwe"].as_str().unwrap().to_string();

        let resp = process_request(
            service(),
            request("jwe_decrypt", json!({"key": key, "jwe": jwe})),
        )
        .await;
        assert_eq!(resp.result.unwrap()["plaintext"], "hello");

        let resp = process_request(
            service(),
            request("jwe_encrypt", json!({"key": BASE64.encode([1u8; 20]), "plaintext": "x"})),
        )
        .await;
        assert_eq!(resp.error.unwrap().code, -32602);
    }

    #[tokio::test]
    async fn test_server_wrap() {
        let public_key = generate_wrapping_key(1024).unwrap().to_public_key();
        let jwk = export_public_key_as_jwk("device", &public_key).unwrap();
        let resp = process_request(
            service(),
            request("server_wrap", json!({"jwk": jwk, "key_size_bits": 128})),
        )
        .await;
        let result = resp.result.unwrap();
        assert_eq!(result["key_size_bits"], 128);
        assert_eq!(BASE64.decode(result["tek"].as_str().unwrap()).unwrap().len(), 16);

        let resp = process_request(service(), request("server_wrap", json!({"jwk": "{}"}))).await;
        assert_eq!(resp.error.unwrap().code, -32602);
    }
}
