pub mod api;
pub mod notify;
pub mod socket;
pub mod transcript;

use chrono::Local;
use corral::{NativePlatform, Supervisor, SupervisorConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing_subscriber::EnvFilter;

use crate::config::{self, GlobalConfig};
use crate::logs;
use crate::paths::Paths;
use crate::protocol::{Request, Response};

const LOG_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
	/// Serve HTTP even if the config does not ask for it.
	pub http: bool,
	pub port: Option<u16>,
}

/// Run the daemon in the foreground until ctrl-c or a `shutdown` request.
pub async fn run(paths: Paths, options: RunOptions) -> std::io::Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(
			EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("herdsman=info,corral=info")),
		)
		.init();

	let global_config = config::load_global_config(&paths.config_file());
	let port = options.port.unwrap_or(global_config.daemon.port);
	let enable_http = options.http || global_config.daemon.http;

	std::fs::create_dir_all(paths.state_dir())?;
	std::fs::write(paths.pid_path(), std::process::id().to_string())?;

	let socket_path = paths.socket_path();
	if socket_path.exists() {
		let _ = std::fs::remove_file(&socket_path);
	}

	let supervisor = build_supervisor(&global_config);
	let health = supervisor.spawn_health_monitor();
	let mut background = vec![health];
	background.extend(spawn_log_tasks(&supervisor, &paths, &global_config));

	if let Some(url) = global_config.notify.url.clone() {
		background.push(tokio::spawn(notify::run(Arc::clone(&supervisor), url)));
	}

	let shutdown = Arc::new(Notify::new());

	let sup_socket = Arc::clone(&supervisor);
	let shutdown_socket = Arc::clone(&shutdown);
	let socket_handle = tokio::spawn(async move {
		let result = socket::run_socket_server(&socket_path, move |req: Request| {
			let sup = Arc::clone(&sup_socket);
			let shutdown = Arc::clone(&shutdown_socket);
			async move { handle_request(&sup, &shutdown, req).await }
		})
		.await;
		if let Err(e) = result {
			tracing::error!("socket server stopped: {}", e);
		}
	});

	let http_handle = if enable_http {
		let sup_http = Arc::clone(&supervisor);
		Some(tokio::spawn(async move {
			run_http_server(sup_http, port).await;
		}))
	} else {
		None
	};

	tracing::info!("daemon started (pid {})", std::process::id());

	tokio::select! {
		_ = socket_handle => {},
		_ = async {
			if let Some(h) = http_handle { h.await.ok(); }
			else { std::future::pending::<()>().await; }
		} => {},
		_ = shutdown.notified() => {
			tracing::info!("shutdown requested");
		}
		_ = tokio::signal::ctrl_c() => {
			tracing::info!("shutting down");
		}
	}

	let killed = supervisor.cleanup().await;
	tracing::info!("stopped {} session(s)", killed);
	for task in background {
		task.abort();
	}

	let _ = std::fs::remove_file(paths.socket_path());
	let _ = std::fs::remove_file(paths.pid_path());
	Ok(())
}

fn build_supervisor(global_config: &GlobalConfig) -> Arc<Supervisor> {
	let platform = NativePlatform::new(global_config.agent.program.clone())
		.with_extra_paths(global_config.agent.extra_paths())
		.with_kill_grace(global_config.supervisor.kill_grace());
	let config = SupervisorConfig {
		health_interval: global_config.supervisor.health_interval(),
		default_working_dir: dirs::home_dir(),
		..SupervisorConfig::default()
	};
	Supervisor::new(config, Arc::new(platform))
}

fn spawn_log_tasks(
	supervisor: &Arc<Supervisor>,
	paths: &Paths,
	global_config: &GlobalConfig,
) -> Vec<tokio::task::JoinHandle<()>> {
	let logs_config = global_config.logs.clone();
	if !logs_config.enabled {
		return Vec::new();
	}
	let log_dir = paths.log_dir();

	let sweep = {
		let log_dir = log_dir.clone();
		let config = logs_config.clone();
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(LOG_SWEEP_INTERVAL);
			loop {
				ticker.tick().await;
				let removed = logs::expire_logs(
					&log_dir,
					config.max_age_days,
					config.max_files,
					Local::now().date_naive(),
				);
				if removed > 0 {
					tracing::info!("expired {} transcript file(s)", removed);
				}
			}
		})
	};

	let writer = tokio::spawn(transcript::run(Arc::downgrade(supervisor), log_dir, logs_config));
	vec![sweep, writer]
}

pub async fn handle_request(supervisor: &Arc<Supervisor>, shutdown: &Notify, request: Request) -> Response {
	match request {
		Request::Ping => Response::Pong { pid: std::process::id() },
		Request::List => Response::Sessions {
			sessions: supervisor.list_sessions().await,
		},
		Request::Get { id } => match supervisor.get_session(&id).await {
			Some(session) => Response::Session { session },
			None => Response::not_found(id),
		},
		Request::Output { id, lines } => {
			if supervisor.get_session(&id).await.is_none() {
				return Response::not_found(id);
			}
			Response::Output {
				text: supervisor.get_output(&id, lines).await,
			}
		}
		Request::Create { options } => match supervisor.create_session(options).await {
			Ok(session) => Response::Session { session },
			Err(e) => Response::error(e.to_string()),
		},
		Request::Input { id, text } => {
			if supervisor.send_input(&id, &text).await {
				Response::ok("sent")
			} else if supervisor.get_session(&id).await.is_some() {
				Response::error("session is not accepting input")
			} else {
				Response::not_found(id)
			}
		}
		Request::Interrupt { id } => {
			if supervisor.interrupt(&id).await {
				Response::ok("interrupted")
			} else if supervisor.get_session(&id).await.is_some() {
				Response::error("interrupt could not be delivered")
			} else {
				Response::not_found(id)
			}
		}
		Request::Kill { id } => {
			if supervisor.kill(&id).await {
				Response::ok("killed")
			} else {
				Response::not_found(id)
			}
		}
		Request::Restart { id } => match supervisor.restart(&id).await {
			Ok(Some(session)) => Response::Session { session },
			Ok(None) => Response::not_found(id),
			Err(e) => Response::error(e.to_string()),
		},
		Request::SetStatus { id, status } => {
			if supervisor.update_status(&id, status).await {
				Response::ok(status.as_str())
			} else {
				Response::not_found(id)
			}
		}
		Request::Link { id, external_id } => {
			if supervisor.link_external_session(&id, &external_id).await {
				Response::ok("linked")
			} else {
				Response::not_found(id)
			}
		}
		Request::FindExternal { external_id } => match supervisor.find_by_external_session(&external_id).await {
			Some(session) => Response::Session { session },
			None => Response::not_found(external_id),
		},
		Request::Cleanup => Response::Cleaned {
			count: supervisor.cleanup().await,
		},
		Request::Shutdown => {
			shutdown.notify_one();
			Response::ok("shutting down")
		}
	}
}

async fn run_http_server(supervisor: Arc<Supervisor>, port: u16) {
	let app = api::router(supervisor);
	let addr = std::net::SocketAddr::from(([127, 0, 0, 1], port));
	let listener = match tokio::net::TcpListener::bind(addr).await {
		Ok(l) => l,
		Err(e) => {
			tracing::error!("failed to bind HTTP on {}: {}", addr, e);
			return;
		}
	};
	tracing::info!("HTTP listening on {}", addr);
	if let Err(e) = axum::serve(listener, app).await {
		tracing::error!("HTTP server error: {}", e);
	}
}

#[cfg(all(test, unix))]
mod tests {
	use super::*;
	use corral::{CreateOptions, LaunchFlags, SessionStatus};

	fn supervisor() -> Arc<Supervisor> {
		let platform = NativePlatform::new("/bin/sh").with_kill_grace(Duration::from_millis(200));
		let config = SupervisorConfig {
			default_working_dir: Some(std::env::temp_dir()),
			..SupervisorConfig::default()
		};
		Supervisor::new(config, Arc::new(platform))
	}

	fn shell() -> CreateOptions {
		CreateOptions {
			name: Some("sh".into()),
			working_dir: None,
			flags: LaunchFlags {
				continue_session: false,
				skip_permissions: false,
				browser: false,
			},
		}
	}

	#[tokio::test]
	async fn unknown_ids_map_to_not_found() {
		let sup = supervisor();
		let shutdown = Notify::new();
		for request in [
			Request::Get { id: "x".into() },
			Request::Output { id: "x".into(), lines: None },
			Request::Input { id: "x".into(), text: "hi".into() },
			Request::Interrupt { id: "x".into() },
			Request::Kill { id: "x".into() },
			Request::Restart { id: "x".into() },
			Request::SetStatus { id: "x".into(), status: SessionStatus::Working },
			Request::Link { id: "x".into(), external_id: "e".into() },
		] {
			assert_eq!(handle_request(&sup, &shutdown, request).await, Response::not_found("x"));
		}
		assert_eq!(
			handle_request(&sup, &shutdown, Request::FindExternal { external_id: "e".into() }).await,
			Response::not_found("e")
		);
	}

	#[tokio::test]
	async fn create_then_kill_through_requests() {
		let sup = supervisor();
		let shutdown = Notify::new();

		let created = handle_request(&sup, &shutdown, Request::Create { options: shell() }).await;
		let Response::Session { session } = created else {
			panic!("unexpected response: {:?}", created);
		};
		assert_eq!(session.status, SessionStatus::Idle);

		let listed = handle_request(&sup, &shutdown, Request::List).await;
		assert!(matches!(listed, Response::Sessions { ref sessions } if sessions.len() == 1));

		assert_eq!(
			handle_request(&sup, &shutdown, Request::Kill { id: session.id.clone() }).await,
			Response::ok("killed")
		);
		assert_eq!(
			handle_request(&sup, &shutdown, Request::Cleanup).await,
			Response::Cleaned { count: 0 }
		);
	}

	#[tokio::test]
	async fn shutdown_request_wakes_the_daemon() {
		let sup = supervisor();
		let shutdown = Notify::new();
		assert_eq!(
			handle_request(&sup, &shutdown, Request::Shutdown).await,
			Response::ok("shutting down")
		);
		tokio::time::timeout(Duration::from_secs(1), shutdown.notified())
			.await
			.expect("shutdown was not signalled");
	}
}
