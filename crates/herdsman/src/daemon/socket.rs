use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

use crate::protocol::{Request, Response};

/// Accept connections on `socket_path` and answer each request line with one
/// response line. Returns only if the socket cannot be bound.
pub async fn run_socket_server<F, Fut>(socket_path: &Path, handler: F) -> std::io::Result<()>
where
	F: Fn(Request) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = Response> + Send,
{
	let listener = UnixListener::bind(socket_path)?;
	tracing::info!("listening on {}", socket_path.display());

	let handler = Arc::new(handler);

	loop {
		let (stream, _) = match listener.accept().await {
			Ok(s) => s,
			Err(e) => {
				tracing::error!("accept error: {}", e);
				continue;
			}
		};

		let handler = Arc::clone(&handler);
		tokio::spawn(async move {
			handle_connection(stream, handler).await;
		});
	}
}

async fn handle_connection<F, Fut>(stream: UnixStream, handler: Arc<F>)
where
	F: Fn(Request) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = Response> + Send,
{
	let (reader, mut writer) = stream.into_split();
	let mut lines = BufReader::new(reader).lines();

	while let Ok(Some(line)) = lines.next_line().await {
		if line.trim().is_empty() {
			continue;
		}
		let response = match serde_json::from_str::<Request>(&line) {
			Ok(request) => handler(request).await,
			Err(e) => {
				tracing::warn!("invalid request: {}", e);
				Response::error(format!("invalid request: {}", e))
			}
		};

		if write_response(&mut writer, &response).await.is_err() {
			break;
		}
	}
}

async fn write_response<W: AsyncWrite + Unpin>(writer: &mut W, response: &Response) -> std::io::Result<()> {
	let mut data = serde_json::to_vec(response).map_err(std::io::Error::other)?;
	data.push(b'\n');
	writer.write_all(&data).await
}
