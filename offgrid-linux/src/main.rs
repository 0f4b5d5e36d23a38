// Offgrid Linux: LAN proximity session daemon driven over JSON lines on stdin/stdout.

mod config;
mod discovery;
mod frame;
mod transport;

use std::sync::Arc;

use anyhow::Context;
use offgrid_core::{LocalIdentity, MethodCall, MethodReply, Session, SessionConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::transport::LanTransport;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// One stdin line: a method call with an optional correlation id echoed in the reply.
#[derive(Debug, Deserialize)]
struct Request {
    #[serde(default)]
    id: Value,
    #[serde(flatten)]
    call: MethodCall,
}

#[derive(Debug, Serialize)]
struct Response {
    id: Value,
    reply: MethodReply,
}

struct Args {
    username: Option<String>,
}

enum Command {
    Run(Args),
    Version,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> anyhow::Result<Command> {
    let mut username = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => return Ok(Command::Version),
            "--username" => {
                username = Some(args.next().context("--username needs a value")?);
            }
            other => anyhow::bail!("unknown argument: {}", other),
        }
    }
    Ok(Command::Run(Args { username }))
}

fn main() -> anyhow::Result<()> {
    let args = match parse_args(std::env::args().skip(1))? {
        Command::Version => {
            println!("offgrid-linux {}", VERSION);
            return Ok(());
        }
        Command::Run(args) => args,
    };

    let cfg = config::load();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let identity = match args.username.or_else(|| cfg.username.clone()) {
        Some(name) => LocalIdentity::new(name),
        None => LocalIdentity::generate(),
    };

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg, identity))
}

async fn run(cfg: config::Config, identity: LocalIdentity) -> anyhow::Result<()> {
    let transport = Arc::new(LanTransport::new(cfg.lan_settings()));
    tracing::info!(
        endpoint = transport.endpoint_id(),
        username = identity.username(),
        service_id = %cfg.service_id,
        "offgrid starting"
    );
    let (session, mut events) =
        Session::new(transport, SessionConfig::new(cfg.service_id.clone(), identity));

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Value>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = out_rx.recv().await {
            let mut bytes = line.to_string().into_bytes();
            bytes.push(b'\n');
            if stdout.write_all(&bytes).await.is_err() || stdout.flush().await.is_err() {
                break;
            }
        }
    });

    let events_out = out_tx.clone();
    let event_task = tokio::spawn(async move {
        while let Some(ev) = events.next().await {
            match serde_json::to_value(&ev) {
                Ok(v) => {
                    if events_out.send(v).is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "event not serializable"),
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            res = &mut shutdown => {
                res?;
                tracing::info!("shutdown signal");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else {
                    tracing::info!("stdin closed");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                let response = handle_line(&session, &line).await;
                out_tx.send(serde_json::to_value(&response)?)?;
            }
        }
    }

    if let Err(e) = session.stop_all().await {
        tracing::warn!(error = %e, "stop on shutdown failed");
    }
    drop(session);
    event_task.abort();
    drop(out_tx);
    let _ = writer.await;
    Ok(())
}

async fn handle_line(session: &Session, line: &str) -> Response {
    match serde_json::from_str::<Request>(line) {
        Ok(req) => Response {
            id: req.id,
            reply: session.dispatch(&req.call).await.into(),
        },
        Err(e) => Response {
            id: Value::Null,
            reply: MethodReply::Error {
                code: "ARG_ERROR".to_owned(),
                message: format!("malformed request: {}", e),
            },
        },
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use offgrid_core::MemoryTransport;
    use serde_json::json;

    use super::*;

    fn args(list: &[&str]) -> impl Iterator<Item = String> {
        list.iter().map(|s| s.to_string()).collect::<Vec<_>>().into_iter()
    }

    #[test]
    fn parses_flags() {
        assert!(matches!(parse_args(args(&["-V"])).unwrap(), Command::Version));
        match parse_args(args(&["--username", "Ada"])).unwrap() {
            Command::Run(a) => assert_eq!(a.username.as_deref(), Some("Ada")),
            Command::Version => panic!("expected run"),
        }
        assert!(parse_args(args(&["--username"])).is_err());
        assert!(parse_args(args(&["--bogus"])).is_err());
    }

    #[tokio::test]
    async fn request_line_round_trip() {
        let (session, _events) = Session::new(
            Arc::new(MemoryTransport::new()),
            SessionConfig::new("svc", LocalIdentity::new("Me")),
        );
        let resp = handle_line(
            &session,
            r#"{"id":7,"method":"connectToEndpoint","args":{"endpointId":"E1"}}"#,
        )
        .await;
        assert_eq!(
            serde_json::to_value(&resp).unwrap(),
            json!({"id": 7, "reply": {"result": "Connection request sent."}})
        );

        let resp = handle_line(&session, r#"{"method":"sendFile"}"#).await;
        assert_eq!(resp.id, Value::Null);
        assert!(matches!(resp.reply, MethodReply::Error { ref code, .. } if code == "NOT_IMPLEMENTED"));

        let resp = handle_line(&session, "not json").await;
        assert!(matches!(resp.reply, MethodReply::Error { ref code, .. } if code == "ARG_ERROR"));
    }
}
