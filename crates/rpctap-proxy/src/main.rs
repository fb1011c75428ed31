use std::path::PathBuf;
use std::process::ExitCode;

use rpctap_proxy::{ProxyConfig, ProxyServer};
use tracing_subscriber::EnvFilter;

fn usage() -> &'static str {
    "usage: rpctap [options]\n\
     \n\
     options:\n\
       --http-port <port>         HTTP CONNECT proxy port (default 8080)\n\
       --socks5-port <port>       SOCKS5 proxy port (default 1080)\n\
       --api-port <port>          management API port (default 8888)\n\
       --state-dir <dir>          CA, key log and record state (default ~/.rpctap)\n\
       --record-file <path>       JSONL record log (default <state>/data/records.jsonl)\n\
       --no-record-file           disable the on-disk record log\n\
       --upstream-proxy <url>     http://, https://, socks5:// upstream hop\n\
       --descriptor-set <path>    serialized FileDescriptorSet for decoding\n\
       --no-http-parsing          forward without observing streams\n\
       --verbose                  debug logging\n"
}

fn parse_args(config: &mut ProxyConfig) -> Result<bool, String> {
    let mut verbose = false;
    let mut args = std::env::args().skip(1);
    let mut explicit_record_file = false;

    while let Some(arg) = args.next() {
        let mut take_value = |name: &str| {
            args.next()
                .ok_or_else(|| format!("{name} requires a value"))
        };
        match arg.as_str() {
            "--http-port" => {
                config.http_port = parse_port(&take_value("--http-port")?)?;
            }
            "--socks5-port" => {
                config.socks5_port = parse_port(&take_value("--socks5-port")?)?;
            }
            "--api-port" => {
                config.api_port = parse_port(&take_value("--api-port")?)?;
            }
            "--state-dir" => {
                config.state_dir = PathBuf::from(take_value("--state-dir")?);
                if !explicit_record_file {
                    config.record_path =
                        Some(config.state_dir.join("data").join("records.jsonl"));
                }
            }
            "--record-file" => {
                config.record_path = Some(PathBuf::from(take_value("--record-file")?));
                explicit_record_file = true;
            }
            "--no-record-file" => {
                config.record_path = None;
                explicit_record_file = true;
            }
            "--upstream-proxy" => {
                config.upstream_proxy = Some(take_value("--upstream-proxy")?);
            }
            "--descriptor-set" => {
                config.descriptor_set_path = Some(PathBuf::from(take_value("--descriptor-set")?));
            }
            "--no-http-parsing" => {
                config.enable_http_parsing = false;
            }
            "--verbose" => {
                verbose = true;
            }
            "--help" | "-h" => {
                print!("{}", usage());
                std::process::exit(0);
            }
            other => return Err(format!("unknown option: {other}")),
        }
    }
    Ok(verbose)
}

fn parse_port(text: &str) -> Result<u16, String> {
    text.parse::<u16>()
        .map_err(|_| format!("invalid port: {text}"))
}

#[tokio::main]
async fn main() -> ExitCode {
    let mut config = ProxyConfig::default();
    let verbose = match parse_args(&mut config) {
        Ok(verbose) => verbose,
        Err(error) => {
            eprintln!("{error}\n\n{}", usage());
            return ExitCode::FAILURE;
        }
    };

    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let server = match ProxyServer::new(config) {
        Ok(server) => server,
        Err(error) => {
            tracing::error!(%error, "startup failed");
            return ExitCode::FAILURE;
        }
    };

    let outcome = tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            Ok(())
        }
    };
    server.cleanup();

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(%error, "proxy stopped");
            ExitCode::FAILURE
        }
    }
}
