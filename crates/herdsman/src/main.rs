mod client;
mod config;
mod daemon;
mod logs;
mod paths;
mod protocol;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use corral::{CreateOptions, LaunchFlags, SessionInfo, SessionStatus};
use owo_colors::OwoColorize;
use std::path::PathBuf;

use client::{ClientError, DaemonClient};
use paths::Paths;
use protocol::{Request, Response};

#[derive(Debug, Parser)]
#[command(name = "herdsman", version, about = "Supervise interactive agent sessions")]
struct Cli {
	#[command(subcommand)]
	command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
	/// Manage the background daemon
	#[command(subcommand)]
	Daemon(DaemonCommand),
	/// List sessions
	#[command(alias = "ls")]
	List(JsonFlag),
	/// Start a new agent session
	New(NewArgs),
	/// Show one session
	Show {
		target: String,
		#[command(flatten)]
		json: JsonFlag,
	},
	/// Type a line into a session
	Send {
		target: String,
		#[arg(required = true, trailing_var_arg = true)]
		text: Vec<String>,
	},
	/// Interrupt the session's current work
	Interrupt { target: String },
	/// Kill a session and remove it
	Kill { target: String },
	/// Replace the session's process with a fresh one
	Restart {
		target: String,
		#[command(flatten)]
		json: JsonFlag,
	},
	/// Report a session's status (idle, working, waiting, offline)
	Status { target: String, status: SessionStatus },
	/// Print buffered output
	Output {
		target: String,
		/// Only the last N lines
		#[arg(short = 'n', long)]
		lines: Option<usize>,
	},
	/// Associate an external conversation id with a session
	Link { target: String, external_id: String },
	/// Find the session linked to an external conversation id
	Find {
		external_id: String,
		#[command(flatten)]
		json: JsonFlag,
	},
	/// Kill every session
	Cleanup,
}

#[derive(Debug, Subcommand)]
enum DaemonCommand {
	/// Run the daemon in the foreground (used internally)
	Run(DaemonRunArgs),
	/// Start the daemon in the background
	Start(DaemonRunArgs),
	/// Stop the running daemon
	Stop,
	/// Show daemon status
	Status,
}

#[derive(Debug, Args)]
struct DaemonRunArgs {
	/// Also serve the HTTP API
	#[arg(long)]
	http: bool,
	/// HTTP port (defaults to the configured one)
	#[arg(long)]
	port: Option<u16>,
}

#[derive(Debug, Args)]
struct JsonFlag {
	/// Print JSON instead of a table
	#[arg(long)]
	json: bool,
}

#[derive(Debug, Args)]
struct NewArgs {
	/// Display name (defaults to session-N)
	#[arg(long)]
	name: Option<String>,
	/// Working directory (defaults to the current one)
	#[arg(long, short = 'C')]
	dir: Option<PathBuf>,
	/// Start a fresh conversation instead of continuing the last one
	#[arg(long)]
	no_continue: bool,
	/// Keep the agent's permission prompts
	#[arg(long)]
	ask_permissions: bool,
	/// Enable the browser integration
	#[arg(long)]
	browser: bool,
	#[command(flatten)]
	json: JsonFlag,
}

fn main() {
	let cli = Cli::parse();
	let paths = Paths::resolve();

	match cli.command {
		Command::Daemon(cmd) => cmd_daemon(&paths, cmd),
		Command::List(flag) => cmd_list(&paths, flag.json),
		Command::New(args) => cmd_new(&paths, args),
		Command::Show { target, json } => {
			let session = resolve_target(&paths, &target);
			print_session(&session, json.json);
		}
		Command::Send { target, text } => {
			let id = resolve_target(&paths, &target).id;
			expect_ok(request(&paths, Request::Input { id, text: text.join(" ") }));
		}
		Command::Interrupt { target } => {
			let id = resolve_target(&paths, &target).id;
			expect_ok(request(&paths, Request::Interrupt { id }));
		}
		Command::Kill { target } => {
			let session = resolve_target(&paths, &target);
			expect_ok(request(&paths, Request::Kill { id: session.id }));
			eprintln!("{} {}", "killed".red(), session.name.bold());
		}
		Command::Restart { target, json } => {
			let id = resolve_target(&paths, &target).id;
			match request(&paths, Request::Restart { id }) {
				Response::Session { session } => print_session(&session, json.json),
				other => fail_response(other),
			}
		}
		Command::Status { target, status } => {
			let id = resolve_target(&paths, &target).id;
			expect_ok(request(&paths, Request::SetStatus { id, status }));
		}
		Command::Output { target, lines } => {
			let id = resolve_target(&paths, &target).id;
			match request(&paths, Request::Output { id, lines }) {
				Response::Output { text } => {
					if !text.is_empty() {
						println!("{}", text);
					}
				}
				other => fail_response(other),
			}
		}
		Command::Link { target, external_id } => {
			let id = resolve_target(&paths, &target).id;
			expect_ok(request(&paths, Request::Link { id, external_id }));
		}
		Command::Find { external_id, json } => match request(&paths, Request::FindExternal { external_id }) {
			Response::Session { session } => print_session(&session, json.json),
			other => fail_response(other),
		},
		Command::Cleanup => match request(&paths, Request::Cleanup) {
			Response::Cleaned { count } => eprintln!("killed {} session(s)", count),
			other => fail_response(other),
		},
	}
}

// --- Daemon management ---

fn cmd_daemon(paths: &Paths, cmd: DaemonCommand) {
	match cmd {
		DaemonCommand::Run(args) => {
			let runtime = match tokio::runtime::Runtime::new() {
				Ok(rt) => rt,
				Err(e) => fail(&format!("cannot start runtime: {}", e)),
			};
			let options = daemon::RunOptions { http: args.http, port: args.port };
			if let Err(e) = runtime.block_on(daemon::run(paths.clone(), options)) {
				fail(&format!("daemon failed: {}", e));
			}
		}
		DaemonCommand::Start(args) => {
			if client::is_running(paths) {
				eprintln!("daemon already running");
				return;
			}
			let mut extra = Vec::new();
			if args.http {
				extra.push("--http".to_string());
			}
			if let Some(port) = args.port {
				extra.push("--port".to_string());
				extra.push(port.to_string());
			}
			match client::spawn_daemon(&extra) {
				Ok(()) => eprintln!("daemon started"),
				Err(e) => fail(&e.to_string()),
			}
		}
		DaemonCommand::Stop => cmd_daemon_stop(paths),
		DaemonCommand::Status => {
			if client::is_running(paths) {
				match paths.read_pid() {
					Some(pid) => eprintln!("daemon {} (pid {})", "running".green(), pid),
					None => eprintln!("daemon {}", "running".green()),
				}
			} else {
				eprintln!("daemon {}", "not running".dimmed());
			}
		}
	}
}

fn cmd_daemon_stop(paths: &Paths) {
	match DaemonClient::connect(paths).and_then(|mut c| c.send(&Request::Shutdown)) {
		Ok(Response::Ok { message }) => {
			eprintln!("daemon: {}", message.unwrap_or_default());
		}
		Ok(other) => fail_response(other),
		Err(_) => {
			// Socket gone but a stale process may still hold the pid file.
			let Some(pid) = paths.read_pid() else {
				eprintln!("daemon not running");
				return;
			};
			use nix::sys::signal::{kill, Signal};
			use nix::unistd::Pid;
			match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
				Ok(()) => eprintln!("sent SIGTERM to daemon (pid {})", pid),
				Err(e) => eprintln!("daemon not running ({})", e),
			}
			let _ = std::fs::remove_file(paths.pid_path());
			let _ = std::fs::remove_file(paths.socket_path());
		}
	}
}

// --- Session commands ---

fn cmd_list(paths: &Paths, json: bool) {
	let sessions = fetch_sessions(paths);
	if json {
		print_json(&sessions);
		return;
	}
	if sessions.is_empty() {
		eprintln!("no sessions");
		return;
	}
	let name_width = sessions.iter().map(|s| s.name.len()).max().unwrap_or(4).max(4);
	let now = Utc::now();
	for session in &sessions {
		print_session_line(session, name_width, now);
	}
}

fn cmd_new(paths: &Paths, args: NewArgs) {
	let working_dir = args
		.dir
		.map(|d| d.canonicalize().unwrap_or(d))
		.or_else(|| std::env::current_dir().ok());
	let options = CreateOptions {
		name: args.name,
		working_dir,
		flags: LaunchFlags {
			continue_session: !args.no_continue,
			skip_permissions: !args.ask_permissions,
			browser: args.browser,
		},
	};
	match request(paths, Request::Create { options }) {
		Response::Session { session } => {
			if args.json.json {
				print_json(&session);
			} else {
				eprintln!("{} {} ({})", "started".green(), session.name.bold(), short_id(&session.id));
			}
		}
		other => fail_response(other),
	}
}

// --- Daemon I/O ---

fn request(paths: &Paths, request: Request) -> Response {
	let result = client::ensure_daemon(paths).and_then(|mut c| c.send(&request));
	match result {
		Ok(response) => response,
		Err(ClientError::NotRunning) => fail("daemon not running and could not be started"),
		Err(e) => fail(&e.to_string()),
	}
}

fn fetch_sessions(paths: &Paths) -> Vec<SessionInfo> {
	match request(paths, Request::List) {
		Response::Sessions { sessions } => sessions,
		other => fail_response(other),
	}
}

/// Accept a full id, a session name, or an unambiguous id prefix.
fn resolve_target(paths: &Paths, target: &str) -> SessionInfo {
	let sessions = fetch_sessions(paths);
	match pick_session(sessions, target) {
		Ok(session) => session,
		Err(msg) => fail(&msg),
	}
}

fn pick_session(sessions: Vec<SessionInfo>, target: &str) -> Result<SessionInfo, String> {
	if let Some(s) = sessions.iter().find(|s| s.id == target) {
		return Ok(s.clone());
	}
	let by_name: Vec<&SessionInfo> = sessions.iter().filter(|s| s.name == target).collect();
	if by_name.len() == 1 {
		return Ok(by_name[0].clone());
	}
	if by_name.len() > 1 {
		return Err(format!("'{}' names {} sessions, use an id", target, by_name.len()));
	}
	let by_prefix: Vec<&SessionInfo> = sessions.iter().filter(|s| s.id.starts_with(target)).collect();
	match by_prefix.as_slice() {
		[one] => Ok((*one).clone()),
		[] => Err(format!("no session matches '{}'", target)),
		many => Err(format!("'{}' is ambiguous ({} sessions)", target, many.len())),
	}
}

fn expect_ok(response: Response) {
	match response {
		Response::Ok { .. } => {}
		other => fail_response(other),
	}
}

fn fail_response(response: Response) -> ! {
	match response {
		Response::Error { message } => fail(&message),
		Response::NotFound { id } => fail(&format!("session not found: {}", id)),
		other => fail(&format!("unexpected response from daemon: {:?}", other)),
	}
}

fn fail(message: &str) -> ! {
	eprintln!("{} {}", "error:".red().bold(), message);
	std::process::exit(1);
}

// --- Rendering ---

fn print_json<T: serde::Serialize>(value: &T) {
	match serde_json::to_string_pretty(value) {
		Ok(s) => println!("{}", s),
		Err(e) => fail(&e.to_string()),
	}
}

fn print_session(session: &SessionInfo, json: bool) {
	if json {
		print_json(session);
		return;
	}
	let now = Utc::now();
	println!("{}  {}", session.name.bold(), session.id.dimmed());
	println!("  status     {}", status_label(session.status));
	println!("  dir        {}", session.working_dir.display());
	println!(
		"  pid        {}",
		session.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into())
	);
	if let Some(code) = session.exit_code {
		println!("  exit code  {}", code);
	}
	println!("  started    {} ago", format_age(session.created_at, now));
	println!("  active     {} ago", format_age(session.last_activity_at, now));
	println!("  output     {} lines", session.output_lines);
	if let Some(ref ext) = session.external_session_id {
		println!("  linked     {}", ext);
	}
	let flags = session.flags.to_args();
	if !flags.is_empty() {
		println!("  flags      {}", flags.join(" ").dimmed());
	}
}

fn print_session_line(session: &SessionInfo, name_width: usize, now: DateTime<Utc>) {
	let circle = match session.status {
		SessionStatus::Idle => "●".green().to_string(),
		SessionStatus::Working => "●".cyan().to_string(),
		SessionStatus::Waiting => "●".yellow().to_string(),
		SessionStatus::Offline => "●".red().to_string(),
	};
	let pid = session.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into());
	println!(
		"{} {:<width$} {} {:<8} {:<8} {:<6} {}",
		circle,
		session.name,
		short_id(&session.id).dimmed(),
		status_label(session.status),
		pid,
		format_age(session.last_activity_at, now),
		session.working_dir.display().dimmed(),
		width = name_width
	);
}

fn status_label(status: SessionStatus) -> String {
	match status {
		SessionStatus::Idle => "idle".green().to_string(),
		SessionStatus::Working => "working".cyan().to_string(),
		SessionStatus::Waiting => "waiting".yellow().to_string(),
		SessionStatus::Offline => "offline".red().to_string(),
	}
}

fn short_id(id: &str) -> &str {
	id.get(..8).unwrap_or(id)
}

fn format_age(then: DateTime<Utc>, now: DateTime<Utc>) -> String {
	let secs = (now - then).num_seconds().max(0);
	if secs < 60 {
		format!("{}s", secs)
	} else if secs < 3600 {
		format!("{}m", secs / 60)
	} else if secs < 86400 {
		let h = secs / 3600;
		let m = (secs % 3600) / 60;
		if m == 0 { format!("{}h", h) } else { format!("{}h{}m", h, m) }
	} else {
		let d = secs / 86400;
		let h = (secs % 86400) / 3600;
		if h == 0 { format!("{}d", d) } else { format!("{}d{}h", d, h) }
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use chrono::Duration;

	fn info(id: &str, name: &str) -> SessionInfo {
		let now = Utc::now();
		SessionInfo {
			id: id.into(),
			name: name.into(),
			status: SessionStatus::Idle,
			working_dir: PathBuf::from("/tmp"),
			created_at: now,
			last_activity_at: now,
			external_session_id: None,
			pid: Some(1),
			exit_code: None,
			output_lines: 0,
			flags: LaunchFlags::default(),
		}
	}

	#[test]
	fn targets_resolve_by_id_name_or_prefix() {
		let sessions = vec![info("abc123", "api"), info("abd456", "web"), info("ffff00", "web")];
		assert_eq!(pick_session(sessions.clone(), "abc123").unwrap().name, "api");
		assert_eq!(pick_session(sessions.clone(), "api").unwrap().id, "abc123");
		assert_eq!(pick_session(sessions.clone(), "abd").unwrap().id, "abd456");
		assert!(pick_session(sessions.clone(), "ab").unwrap_err().contains("ambiguous"));
		assert!(pick_session(sessions.clone(), "web").unwrap_err().contains("use an id"));
		assert!(pick_session(sessions, "zzz").unwrap_err().contains("no session"));
	}

	#[test]
	fn ages_are_compact() {
		let now = Utc::now();
		assert_eq!(format_age(now - Duration::seconds(42), now), "42s");
		assert_eq!(format_age(now - Duration::minutes(5), now), "5m");
		assert_eq!(format_age(now - Duration::minutes(90), now), "1h30m");
		assert_eq!(format_age(now - Duration::hours(49), now), "2d1h");
		assert_eq!(format_age(now + Duration::seconds(5), now), "0s");
	}

	#[test]
	fn cli_parses_session_commands() {
		let cli = Cli::try_parse_from(["herdsman", "send", "api", "fix", "the", "tests"]).unwrap();
		match cli.command {
			Command::Send { target, text } => {
				assert_eq!(target, "api");
				assert_eq!(text.join(" "), "fix the tests");
			}
			other => panic!("unexpected command: {:?}", other),
		}

		let cli = Cli::try_parse_from(["herdsman", "status", "api", "waiting"]).unwrap();
		assert!(matches!(cli.command, Command::Status { status: SessionStatus::Waiting, .. }));

		assert!(Cli::try_parse_from(["herdsman", "status", "api", "busy"]).is_err());

		let cli = Cli::try_parse_from(["herdsman", "daemon", "run", "--http", "--port", "9000"]).unwrap();
		assert!(matches!(
			cli.command,
			Command::Daemon(DaemonCommand::Run(DaemonRunArgs { http: true, port: Some(9000) }))
		));
	}

	#[test]
	fn new_flags_invert_into_launch_flags() {
		let cli = Cli::try_parse_from(["herdsman", "new", "--no-continue", "--browser", "--name", "x"]).unwrap();
		let Command::New(args) = cli.command else {
			panic!("expected new");
		};
		assert!(args.no_continue);
		assert!(!args.ask_permissions);
		assert!(args.browser);
		assert_eq!(args.name.as_deref(), Some("x"));
	}
}
