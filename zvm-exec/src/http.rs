use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::StreamExt;

use zvm_dag::{JobSpec, LocalObjectBinding, Location, NexeHeaders};
use zvm_daemon::{DaemonClient, DaemonReaper};
use zvm_pool::ThreadPoolRegistry;
use zvm_sandbox::SandboxRunner;
use zvm_store::{FilesystemOps, TempArea};

use crate::colocation;
use crate::config::NodeConfig;
use crate::coordinator::{self, CommitSink};
use crate::error::NodeError;
use crate::ingest::Ingest;
use crate::resolver::{self, ObjectLookup};
use crate::sysmap;
use crate::validator::{self, ValidationSink};

/// The tar content types a standalone execution body is accepted under.
const TAR_CONTENT_TYPES: &[&str] = &[
    "application/x-tar",
    "application/x-gtar",
    "application/x-ustar",
    "application/x-gzip",
];

/// Everything a running node needs to answer a request. Constructed once at startup and shared
/// across every request behind an `Arc`.
pub struct AppState {
    /// Typed node configuration.
    pub config: NodeConfig,
    /// Read path seam standing in for the out-of-scope `ObjectStore`.
    pub lookup: Arc<dyn ObjectLookup>,
    /// Write path seam for committing a writable channel's result.
    pub sink: Arc<dyn CommitSink>,
    /// Write path seam for recording a successful validation.
    pub validation_sink: Arc<dyn ValidationSink>,
    /// Runs the sandbox as a standalone child process (also used to boot a fresh daemon).
    pub sandbox: Arc<dyn SandboxRunner>,
    /// Named admission pools the sandbox is dispatched through.
    pub pools: Arc<ThreadPoolRegistry>,
    /// Finds and kills whatever process is holding a stale daemon socket.
    pub reaper: Arc<dyn DaemonReaper>,
    /// Directory cached daemon sockets live under, keyed by the `x-zerovm-daemon` header value.
    pub sockets_dir: PathBuf,
    /// Root directory temp areas are scoped under, one subdirectory per device.
    pub devices_root: PathBuf,
    /// Filesystem operations, injected so tests can run against an in-memory fake.
    pub fs: Arc<dyn FilesystemOps>,
}

/// Build the router exposing `/:device/:partition/:account/*rest`, where `rest` is `""`,
/// `container`, or `container/object` — axum has no native syntax for optional path segments, so
/// the trailing account/container/object portion is captured as one wildcard and split by hand.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/{device}/{partition}/{account}/{*rest}",
            get(handle).post(handle).put(handle),
        )
        .route(
            "/{device}/{partition}/{account}",
            get(handle_no_rest).post(handle_no_rest).put(handle_no_rest),
        )
        .with_state(state)
}

async fn handle_no_rest(
    state: State<Arc<AppState>>,
    Path((device, partition, account)): Path<(String, String, String)>,
    method: Method,
    headers: HeaderMap,
    body: Body,
) -> Response {
    dispatch(state, device, partition, account, String::new(), method, headers, body).await
}

async fn handle(
    state: State<Arc<AppState>>,
    Path((device, partition, account, rest)): Path<(String, String, String, String)>,
    method: Method,
    headers: HeaderMap,
    body: Body,
) -> Response {
    dispatch(state, device, partition, account, rest, method, headers, body).await
}

async fn dispatch(
    State(state): State<Arc<AppState>>,
    device: String,
    partition: String,
    account: String,
    rest: String,
    method: Method,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let mut nexe = NexeHeaders::default();
    let (container, object) = split_rest(&rest);
    let result = route_request(
        &state, &device, &partition, &account, container, object, &method, &headers, body, &mut nexe,
    )
    .await;
    match result {
        Ok(response) => response,
        Err(err) => err.into_response_with_headers(&nexe),
    }
}

fn split_rest(rest: &str) -> (Option<&str>, Option<&str>) {
    let rest = rest.trim_start_matches('/');
    if rest.is_empty() {
        return (None, None);
    }
    match rest.split_once('/') {
        Some((container, object)) => (Some(container), Some(object)),
        None => (Some(rest), None),
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

#[allow(clippy::too_many_arguments)]
async fn route_request(
    state: &Arc<AppState>,
    device: &str,
    partition: &str,
    account: &str,
    container: Option<&str>,
    object: Option<&str>,
    method: &Method,
    headers: &HeaderMap,
    body: Body,
    nexe: &mut NexeHeaders,
) -> Result<Response, NodeError> {
    let _ = partition;
    if header_str(headers, "x-zerocloud-id").is_none() {
        return Err(NodeError::InternalError(
            "Missing required X-Zerocloud-Id header".to_string(),
        ));
    }

    if let Some(probe) = header_str(headers, "x-nexe-colocated") {
        nexe.colocated = colocation::reply(probe);
    }

    let wants_validate = headers.contains_key("x-zerovm-validate")
        || header_str(headers, "content-type") == Some("application/x-nexe");
    let wants_is_valid = method == Method::GET && headers.contains_key("x-zerovm-valid");

    if wants_is_valid {
        return handle_is_valid(state, account, container, object);
    }
    if wants_validate && (method == Method::POST || method == Method::PUT) {
        return handle_validate(state, account, container, object).await;
    }
    if headers.contains_key("x-zerovm-execute") && method == Method::POST {
        return handle_execute(state, device, account, container, object, headers, body, nexe).await;
    }

    Err(NodeError::MethodNotAllowed(format!(
        "No handler for {method} on this route"
    )))
}

fn handle_is_valid(
    state: &Arc<AppState>,
    account: &str,
    container: Option<&str>,
    object: Option<&str>,
) -> Result<Response, NodeError> {
    let (container, object) = require_object(container, object)?;
    let info = state
        .lookup
        .local_object(account, container, object)
        .ok_or_else(|| NodeError::NotFound("Object not found".to_string()))?;
    let valid = validator::is_validated(info.validated.as_deref(), Some(&info.etag));
    Ok((StatusCode::OK, valid.to_string()).into_response())
}

async fn handle_validate(
    state: &Arc<AppState>,
    account: &str,
    container: Option<&str>,
    object: Option<&str>,
) -> Result<Response, NodeError> {
    let (container, object) = require_object(container, object)?;
    let info = state
        .lookup
        .local_object(account, container, object)
        .ok_or_else(|| NodeError::NotFound("Object not found".to_string()))?;
    if info.content_length > state.config.zerovm_maxnexe {
        return Err(NodeError::BadRequest(
            "Executable exceeds the configured maximum nexe size".to_string(),
        ));
    }

    let state = state.clone();
    let account = account.to_string();
    let container = container.to_string();
    let object = object.to_string();
    tokio::task::spawn_blocking(move || {
        let temp_area = TempArea::new(&state.devices_root.join("validate").join("tmp"), state.fs.clone())
            .map_err(|e| NodeError::InternalError(format!("Failed to allocate validation temp area: {e:?}")))?;
        let timeout = state.config.zerovm_timeout;
        let manifest = validator::build_validation_manifest(
            &state.config.zerovm_manifest_ver,
            &info.data_path,
            timeout,
            state.config.zerovm_maxnexemem,
        );
        let manifest_path = temp_area
            .mkstemp("validate-manifest")
            .map_err(|e| NodeError::InternalError(format!("Failed to write validation manifest: {e:?}")))?;
        std::fs::write(&manifest_path, manifest)
            .map_err(|e| NodeError::InternalError(format!("Failed to write validation manifest: {e}")))?;

        let validated = validator::validate_and_mark(
            &state.pools,
            state.sandbox.clone(),
            state.validation_sink.as_ref(),
            &account,
            &container,
            &object,
            &info.etag,
            manifest_path,
            timeout,
        )?;
        Ok::<_, NodeError>((StatusCode::OK, validated.to_string()).into_response())
    })
    .await
    .map_err(|e| NodeError::InternalError(format!("Validation task panicked: {e}")))?
}

fn require_object<'a>(
    container: Option<&'a str>,
    object: Option<&'a str>,
) -> Result<(&'a str, &'a str), NodeError> {
    match (container, object) {
        (Some(c), Some(o)) => Ok((c, o)),
        _ => Err(NodeError::BadRequest(
            "This route requires an account/container/object path".to_string(),
        )),
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_execute(
    state: &Arc<AppState>,
    device: &str,
    account: &str,
    container: Option<&str>,
    object: Option<&str>,
    headers: &HeaderMap,
    body: Body,
    nexe: &mut NexeHeaders,
) -> Result<Response, NodeError> {
    let content_type = header_str(headers, "content-type").unwrap_or_default();
    if !TAR_CONTENT_TYPES.iter().any(|t| *t == content_type) {
        return Err(NodeError::BadRequest(format!(
            "Unsupported or missing Content-Type {content_type:?} for an execute request"
        )));
    }

    let temp_area = TempArea::new(&state.devices_root.join(device).join("tmp"), state.fs.clone())
        .map_err(|e| NodeError::InternalError(format!("Failed to allocate request temp area: {e:?}")))?;

    let mut ingest = Ingest::new(&temp_area, state.config.zerovm_maxinput, state.config.max_upload_time);
    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| NodeError::ClientDisconnect(format!("Client disconnected mid-upload: {e}")))?;
        ingest.feed(&chunk)?;
    }
    let (sysmap_bytes, uploaded_files) = ingest.finish()?;

    let mut job = sysmap::parse(&sysmap_bytes)?;
    nexe.system = Some(job.name.clone());
    if let Some(probe) = header_str(headers, "x-nexe-colocated") {
        job.colocated = Some(probe.to_string());
    }

    let mut binding = LocalObjectBinding::new(account, container.unwrap_or_default(), object.map(str::to_string));
    let timestamp = header_str(headers, "x-timestamp").unwrap_or_default().to_string();
    let pool = header_str(headers, "x-zerovm-pool").unwrap_or("default").to_string();
    let job_id = header_str(headers, "x-zerocloud-id").unwrap_or_default().to_string();
    let timeout = header_str(headers, "x-zerovm-timeout")
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(state.config.zerovm_timeout);
    let daemon_socket = header_str(headers, "x-zerovm-daemon").map(str::to_string);

    if !state
        .pools
        .can_admit(&pool, &job_id)
        .map_err(|e| NodeError::BadRequest(format!("Unknown thread pool {pool:?}: {e}")))?
    {
        return Err(NodeError::ServiceUnavailable(format!(
            "Thread pool {pool:?} is saturated"
        )));
    }
    nexe.policy = Some(pool);

    let state = state.clone();
    let result = tokio::task::spawn_blocking(move || {
        run_job(&state, job, binding, uploaded_files, &temp_area, timeout, &timestamp, daemon_socket)
    })
    .await
    .map_err(|e| NodeError::InternalError(format!("Execution task panicked: {e}")))??;

    nexe.validation = result.headers.validation;
    nexe.retcode = result.headers.retcode;
    nexe.etag = result.headers.etag;
    nexe.cdr_line = result.headers.cdr_line;
    nexe.status = result.headers.status;
    nexe.daemon = result.headers.daemon;

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/x-gtar")
        .header("content-length", result.content_length.to_string());
    for (name, value) in nexe.to_header_pairs() {
        response = response.header(name, value);
    }
    response
        .body(Body::from(result.body))
        .map_err(|e| NodeError::InternalError(format!("Failed to build response: {e}")))
}

struct JobOutcome {
    headers: NexeHeaders,
    body: Vec<u8>,
    content_length: u64,
}

fn run_job(
    state: &AppState,
    mut job: JobSpec,
    mut binding: LocalObjectBinding,
    uploaded_files: HashMap<String, PathBuf>,
    temp_area: &TempArea,
    timeout: Duration,
    timestamp: &str,
    daemon_socket: Option<String>,
) -> Result<JobOutcome, NodeError> {
    let response_channels = resolver::resolve(
        &mut job,
        &mut binding,
        &uploaded_files,
        state.lookup.as_ref(),
        &state.config,
        temp_area,
    )?;

    let exe_path = resolve_exe_path(&job, &uploaded_files, &state.config)?;
    let manifest_channels = coordinator::build_manifest_channels(&job, &state.config);
    let manifest = zvm_sandbox::render_manifest(
        &state.config.zerovm_manifest_ver,
        &exe_path,
        timeout,
        state.config.zerovm_maxnexemem,
        &manifest_channels,
    );
    let manifest_path = temp_area
        .mkstemp("manifest")
        .map_err(|e| NodeError::InternalError(format!("Failed to allocate manifest file: {e:?}")))?;
    std::fs::write(&manifest_path, &manifest)
        .map_err(|e| NodeError::InternalError(format!("Failed to write manifest: {e}")))?;

    let mut headers = NexeHeaders::default();
    let (run_code, report) = if let Some(socket_name) = daemon_socket {
        let client = DaemonClient {
            socket_path: state.sockets_dir.join(socket_name),
            stdout_max: 65536,
        };
        let (run_code, report, restarted) = coordinator::run_daemon(
            &client,
            state.reaper.as_ref(),
            state.sandbox.as_ref(),
            &manifest_path,
            timeout,
            manifest.as_bytes(),
            timeout,
        )?;
        if restarted {
            headers.daemon = Some("true".to_string());
        }
        (run_code, report)
    } else {
        coordinator::run_standalone(state.sandbox.as_ref(), &manifest_path, timeout)?
    };
    coordinator::headers_from_report(&mut headers, &report, run_code);

    coordinator::finalize_local_object(&job, &binding, &report, timestamp, state.sink.as_ref())?;

    let (body, content_length) = coordinator::assemble_response(&mut job, &response_channels)?;
    Ok(JobOutcome { headers, body, content_length })
}

fn resolve_exe_path(
    job: &JobSpec,
    uploaded_files: &HashMap<String, PathBuf>,
    config: &NodeConfig,
) -> Result<PathBuf, NodeError> {
    if let Some(path) = uploaded_files.get("boot") {
        return Ok(path.clone());
    }
    match &job.exe {
        Location::LocalPath(path) => Ok(path.clone()),
        Location::ImagePath { image, .. } => config
            .sysimage_devices
            .get(image)
            .cloned()
            .ok_or_else(|| NodeError::BadRequest(format!("Unknown system image device {image:?}"))),
        Location::SwiftPath { .. } => Err(NodeError::BadRequest(
            "Executable must be an uploaded 'boot' file or a system image path".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_rest_handles_all_three_shapes() {
        assert_eq!(split_rest(""), (None, None));
        assert_eq!(split_rest("/c"), (Some("c"), None));
        assert_eq!(split_rest("/c/o"), (Some("c"), Some("o")));
    }

    #[test]
    fn resolve_exe_path_prefers_an_uploaded_boot_file() {
        let mut uploaded = HashMap::new();
        uploaded.insert("boot".to_string(), PathBuf::from("/tmp/boot-bin"));
        let job = JobSpec {
            name: "job".into(),
            replicate: 0,
            replicas: vec![],
            exe: Location::LocalPath("/bin/true".into()),
            channels: vec![],
            colocated: None,
        };
        let config = test_config();
        assert_eq!(resolve_exe_path(&job, &uploaded, &config).unwrap(), PathBuf::from("/tmp/boot-bin"));
    }

    #[test]
    fn resolve_exe_path_falls_back_to_a_local_path() {
        let job = JobSpec {
            name: "job".into(),
            replicate: 0,
            replicas: vec![],
            exe: Location::LocalPath("/bin/true".into()),
            channels: vec![],
            colocated: None,
        };
        let config = test_config();
        assert_eq!(resolve_exe_path(&job, &HashMap::new(), &config).unwrap(), PathBuf::from("/bin/true"));
    }

    #[test]
    fn resolve_exe_path_rejects_an_unresolved_swift_path() {
        let job = JobSpec {
            name: "job".into(),
            replicate: 0,
            replicas: vec![],
            exe: Location::SwiftPath { account: "a".into(), container: "c".into(), object: Some("o".into()) },
            channels: vec![],
            colocated: None,
        };
        let config = test_config();
        let err = resolve_exe_path(&job, &HashMap::new(), &config).unwrap_err();
        assert!(matches!(err, NodeError::BadRequest(_)));
    }

    fn test_config() -> NodeConfig {
        NodeConfig::parse(
            "zerovm_exename = /bin/true\n\
             zerovm_kill_timeout = 1\n\
             zerovm_maxnexe = 1\n\
             zerovm_threadpools = default = WaitPool(1,1)\n\
             zerovm_maxiops = 1\n\
             zerovm_maxinput = 1024\n\
             zerovm_maxoutput = 1024\n\
             zerovm_manifest_ver = 1\n\
             zerovm_timeout = 1\n\
             zerovm_maxnexemem = 1\n\
             disk_chunk_size = 1\n\
             network_chunk_size = 1\n\
             max_upload_time = 1\n",
        )
        .unwrap()
    }
}
