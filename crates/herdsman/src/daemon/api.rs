use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use corral::{CreateOptions, SessionEvent, SessionInfo, SessionStatus, Supervisor, SupervisorError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::CorsLayer;

#[derive(Clone)]
pub struct AppState {
	pub supervisor: Arc<Supervisor>,
}

pub fn router(supervisor: Arc<Supervisor>) -> Router {
	let state = AppState { supervisor };

	Router::new()
		.route("/api/sessions", get(list_sessions).post(create_session))
		.route("/api/sessions/{id}", get(session_detail).delete(kill_session))
		.route("/api/sessions/{id}/output", get(session_output))
		.route("/api/sessions/{id}/input", post(send_input))
		.route("/api/sessions/{id}/interrupt", post(interrupt_session))
		.route("/api/sessions/{id}/restart", post(restart_session))
		.route("/api/sessions/{id}/status", put(set_status))
		.route("/api/sessions/{id}/link", put(link_session))
		.route("/api/external/{external_id}", get(find_external))
		.route("/api/cleanup", post(cleanup))
		.route("/ws/sessions/{id}", get(ws_session))
		.layer(CorsLayer::permissive())
		.with_state(state)
}

#[derive(Serialize, Deserialize)]
struct ActionResponse {
	message: String,
}

#[derive(Serialize, Deserialize)]
struct ErrorResponse {
	error: String,
}

#[derive(Serialize, Deserialize)]
struct OutputResponse {
	text: String,
}

#[derive(Serialize, Deserialize)]
struct CleanupResponse {
	killed: usize,
}

#[derive(Deserialize)]
struct OutputQuery {
	lines: Option<usize>,
}

#[derive(Deserialize)]
struct InputBody {
	text: String,
}

#[derive(Deserialize)]
struct StatusBody {
	status: String,
}

#[derive(Deserialize)]
struct LinkBody {
	external_id: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<Json<T>, ApiError>;

fn api_error(status: StatusCode, error: impl Into<String>) -> ApiError {
	(status, Json(ErrorResponse { error: error.into() }))
}

fn not_found(id: &str) -> ApiError {
	api_error(StatusCode::NOT_FOUND, format!("session not found: {}", id))
}

fn done(found: bool, id: &str, message: &str) -> ApiResult<ActionResponse> {
	if found {
		Ok(Json(ActionResponse { message: message.to_string() }))
	} else {
		Err(not_found(id))
	}
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
	Json(state.supervisor.list_sessions().await)
}

async fn create_session(
	State(state): State<AppState>,
	Json(options): Json<CreateOptions>,
) -> Result<(StatusCode, Json<SessionInfo>), ApiError> {
	state
		.supervisor
		.create_session(options)
		.await
		.map(|info| (StatusCode::CREATED, Json(info)))
		.map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

async fn session_detail(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<SessionInfo> {
	state.supervisor.get_session(&id).await.map(Json).ok_or_else(|| not_found(&id))
}

async fn kill_session(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<ActionResponse> {
	done(state.supervisor.kill(&id).await, &id, "killed")
}

async fn session_output(
	State(state): State<AppState>,
	Path(id): Path<String>,
	Query(query): Query<OutputQuery>,
) -> ApiResult<OutputResponse> {
	if state.supervisor.get_session(&id).await.is_none() {
		return Err(not_found(&id));
	}
	let text = state.supervisor.get_output(&id, query.lines).await;
	Ok(Json(OutputResponse { text }))
}

async fn send_input(
	State(state): State<AppState>,
	Path(id): Path<String>,
	Json(body): Json<InputBody>,
) -> ApiResult<ActionResponse> {
	if state.supervisor.send_input(&id, &body.text).await {
		return Ok(Json(ActionResponse { message: "sent".into() }));
	}
	match state.supervisor.get_session(&id).await {
		Some(_) => Err(api_error(StatusCode::CONFLICT, "session is not accepting input")),
		None => Err(not_found(&id)),
	}
}

async fn interrupt_session(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<ActionResponse> {
	if state.supervisor.interrupt(&id).await {
		return Ok(Json(ActionResponse { message: "interrupted".into() }));
	}
	match state.supervisor.get_session(&id).await {
		Some(_) => Err(api_error(StatusCode::CONFLICT, "interrupt could not be delivered")),
		None => Err(not_found(&id)),
	}
}

async fn restart_session(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<SessionInfo> {
	match state.supervisor.restart(&id).await {
		Ok(Some(info)) => Ok(Json(info)),
		Ok(None) => Err(not_found(&id)),
		Err(e @ SupervisorError::RestartInProgress { .. }) => Err(api_error(StatusCode::CONFLICT, e.to_string())),
		Err(e) => Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
	}
}

async fn set_status(
	State(state): State<AppState>,
	Path(id): Path<String>,
	Json(body): Json<StatusBody>,
) -> ApiResult<ActionResponse> {
	let status: SessionStatus = body
		.status
		.parse()
		.map_err(|e: String| api_error(StatusCode::BAD_REQUEST, e))?;
	done(state.supervisor.update_status(&id, status).await, &id, status.as_str())
}

async fn link_session(
	State(state): State<AppState>,
	Path(id): Path<String>,
	Json(body): Json<LinkBody>,
) -> ApiResult<ActionResponse> {
	done(
		state.supervisor.link_external_session(&id, &body.external_id).await,
		&id,
		"linked",
	)
}

async fn find_external(
	State(state): State<AppState>,
	Path(external_id): Path<String>,
) -> ApiResult<SessionInfo> {
	state
		.supervisor
		.find_by_external_session(&external_id)
		.await
		.map(Json)
		.ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("no session linked to {}", external_id)))
}

async fn cleanup(State(state): State<AppState>) -> Json<CleanupResponse> {
	Json(CleanupResponse { killed: state.supervisor.cleanup().await })
}

async fn ws_session(
	State(state): State<AppState>,
	Path(id): Path<String>,
	ws: WebSocketUpgrade,
) -> impl IntoResponse {
	ws.on_upgrade(move |socket| stream_session(socket, state, id))
}

/// Replay the buffer, then forward live output until the client leaves or
/// the session is gone.
async fn stream_session(mut socket: WebSocket, state: AppState, id: String) {
	let mut events = state.supervisor.subscribe();

	if state.supervisor.get_session(&id).await.is_none() {
		let _ = socket.send(Message::Close(None)).await;
		return;
	}

	let snapshot = state.supervisor.get_output(&id, None).await;
	if !snapshot.is_empty() && socket.send(Message::Text(format!("{}\n", snapshot).into())).await.is_err() {
		return;
	}

	loop {
		tokio::select! {
			incoming = socket.recv() => match incoming {
				Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
				Some(Ok(_)) => {}
			},
			event = events.recv() => match event {
				Ok(SessionEvent::Output { session_id, text }) if session_id == id => {
					if socket.send(Message::Text(text.into())).await.is_err() {
						return;
					}
				}
				Ok(SessionEvent::Exit { session_id, .. }) if session_id == id => {
					if state.supervisor.get_session(&id).await.is_none() {
						let _ = socket.send(Message::Close(None)).await;
						return;
					}
				}
				Ok(_) => {}
				Err(RecvError::Lagged(skipped)) => {
					tracing::debug!("ws {}: skipped {} events", id, skipped);
				}
				Err(RecvError::Closed) => return,
			},
		}
	}
}

#[cfg(all(test, unix))]
mod tests {
	use super::*;
	use corral::{LaunchFlags, NativePlatform, SupervisorConfig};
	use std::time::Duration;

	/// Serve the router on an ephemeral port backed by `/bin/sh` sessions.
	async fn serve() -> (String, Arc<Supervisor>) {
		let platform = Arc::new(NativePlatform::new("/bin/sh").with_kill_grace(Duration::from_millis(200)));
		let config = SupervisorConfig {
			default_working_dir: Some(std::env::temp_dir()),
			..SupervisorConfig::default()
		};
		let supervisor = Supervisor::new(config, platform);
		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		let app = router(Arc::clone(&supervisor));
		tokio::spawn(async move {
			let _ = axum::serve(listener, app).await;
		});
		(format!("http://{}", addr), supervisor)
	}

	fn shell_options(name: &str) -> CreateOptions {
		CreateOptions {
			name: Some(name.into()),
			working_dir: None,
			flags: LaunchFlags {
				continue_session: false,
				skip_permissions: false,
				browser: false,
			},
		}
	}

	#[tokio::test]
	async fn unknown_session_is_404() {
		let (base, _sup) = serve().await;
		let client = reqwest::Client::new();

		let resp = client.get(format!("{}/api/sessions/nope", base)).send().await.unwrap();
		assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);

		let resp = client.delete(format!("{}/api/sessions/nope", base)).send().await.unwrap();
		assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);

		let list: Vec<SessionInfo> = client
			.get(format!("{}/api/sessions", base))
			.send()
			.await
			.unwrap()
			.json()
			.await
			.unwrap();
		assert!(list.is_empty());
	}

	#[tokio::test]
	async fn session_lifecycle_over_http() {
		let (base, sup) = serve().await;
		let client = reqwest::Client::new();

		let resp = client
			.post(format!("{}/api/sessions", base))
			.json(&shell_options("shell"))
			.send()
			.await
			.unwrap();
		assert_eq!(resp.status(), reqwest::StatusCode::CREATED);
		let info: SessionInfo = resp.json().await.unwrap();
		assert_eq!(info.name, "shell");
		assert_eq!(info.status, SessionStatus::Idle);

		let resp = client
			.post(format!("{}/api/sessions/{}/input", base, info.id))
			.json(&serde_json::json!({"text": "echo over-http"}))
			.send()
			.await
			.unwrap();
		assert!(resp.status().is_success());

		let mut seen = String::new();
		for _ in 0..100 {
			let out: OutputResponse = client
				.get(format!("{}/api/sessions/{}/output?lines=5", base, info.id))
				.send()
				.await
				.unwrap()
				.json()
				.await
				.unwrap();
			seen = out.text;
			if seen.contains("over-http") {
				break;
			}
			tokio::time::sleep(Duration::from_millis(50)).await;
		}
		assert_eq!(seen, "over-http");

		let resp = client
			.put(format!("{}/api/sessions/{}/status", base, info.id))
			.json(&serde_json::json!({"status": "busy"}))
			.send()
			.await
			.unwrap();
		assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

		let resp = client
			.put(format!("{}/api/sessions/{}/status", base, info.id))
			.json(&serde_json::json!({"status": "working"}))
			.send()
			.await
			.unwrap();
		assert!(resp.status().is_success());
		assert_eq!(sup.get_session(&info.id).await.map(|s| s.status), Some(SessionStatus::Working));

		let resp = client
			.put(format!("{}/api/sessions/{}/link", base, info.id))
			.json(&serde_json::json!({"external_id": "conv-1"}))
			.send()
			.await
			.unwrap();
		assert!(resp.status().is_success());
		let found: SessionInfo = client
			.get(format!("{}/api/external/conv-1", base))
			.send()
			.await
			.unwrap()
			.json()
			.await
			.unwrap();
		assert_eq!(found.id, info.id);

		let cleaned: CleanupResponse = client
			.post(format!("{}/api/cleanup", base))
			.send()
			.await
			.unwrap()
			.json()
			.await
			.unwrap();
		assert_eq!(cleaned.killed, 1);
		assert!(sup.list_sessions().await.is_empty());
	}
}
