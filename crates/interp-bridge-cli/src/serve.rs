//! Rust-hosted endpoint.
//!
//! Accepts the same argv shape as the Python endpoint (`-u <module> <port>`)
//! so a `ProcessSupervisor` can launch it with `InterpreterCommand::with_command("serve")`.

use crate::arith;
use anyhow::{anyhow, bail, Result};
use interp_bridge::{
    BridgeConfig, HandlerRegistry, Marshaller, RegistrationPolicy, RpcServer, SupervisorConfig,
};
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Serve handler set `module` on `port`. Returns the process exit code.
pub async fn run(module: &str, port: u16) -> Result<i32> {
    let set = Path::new(module)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(module);
    if set != "arith" {
        bail!("unknown handler set '{}' (available: arith)", module);
    }

    let config = SupervisorConfig::from_env();
    let registry = HandlerRegistry::new(Arc::new(Marshaller::from_config(&config)))
        .with_policy(RegistrationPolicy::from_env())
        .with_evaluator(Arc::new(arith::catalog()));
    arith::install(&registry).map_err(|e| anyhow!("failed to install {}: {}", set, e))?;

    let listener = match TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await {
        Ok(listener) => listener,
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            warn!("Port {} is already in use", port);
            return Ok(BridgeConfig::BIND_CONFLICT_EXIT_CODE);
        }
        Err(e) => return Err(e.into()),
    };

    let handle = RpcServer::serve(listener, Arc::new(registry))?;

    // The supervisor and test harnesses read this line from stdout.
    println!("{}{}", BridgeConfig::READY_LINE_PREFIX, handle.port());
    info!(
        "Serving '{}' on {} (registration policy: {})",
        set,
        handle.addr(),
        RegistrationPolicy::from_env()
    );

    tokio::select! {
        _ = handle.stopped() => info!("Shutdown requested by client"),
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
            handle.shutdown();
        }
    }
    Ok(0)
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => warn!("Cannot listen for SIGTERM: {}", e),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Cannot listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
}
