use std::path::PathBuf;
use std::sync::Arc;

use wicket_proxy::{
    ConnectionConfig, DnsResolver, ProxyServer, RateLimits, ServerConfig, SystemResolver,
};
use wicket_settings::{ConfigLoader, WicketConfig};

use crate::cli::RunArgs;
use crate::error::CliError;

pub async fn run(args: RunArgs, cwd: PathBuf) -> Result<(), CliError> {
    // Load and merge config.
    // --no-config skips global/project config files but --config <extra> still applies.
    let mut config = if args.no_config {
        WicketConfig::default()
    } else {
        ConfigLoader::load(&cwd)
    };
    if let Some(ref extra) = args.extra_config {
        let extra_cfg = WicketConfig::load(extra)?;
        config = config.merge(extra_cfg);
    }
    if let Some(bind) = args.bind {
        config.listener.bind_addr = Some(bind);
    }
    config.validate()?;

    let server_config = server_config_from(&config)?;
    let (dns, _stats, _dns_join) = DnsResolver::spawn(
        Arc::new(SystemResolver),
        config.dns.effective_cache_cleanup_period(),
    );

    let handle = ProxyServer::new(server_config, dns)?.start().await?;
    println!("wicket listening on {}", handle.local_addr());

    tokio::signal::ctrl_c().await?;
    handle.shutdown().await;
    Ok(())
}

/// Map the layered settings onto the server's config types.
pub(crate) fn server_config_from(config: &WicketConfig) -> Result<ServerConfig, CliError> {
    let bind_addr = config
        .listener
        .bind_addr
        .as_deref()
        .unwrap_or("127.0.0.1:3128");
    let bind_addr = bind_addr
        .parse()
        .map_err(|_| CliError::Other(format!("invalid bind address: {bind_addr}")))?;

    Ok(ServerConfig {
        bind_addr,
        max_connections: config.listener.effective_max_connections(),
        connection: ConnectionConfig {
            io_chunk_size: config.listener.effective_io_chunk_size(),
            idle_connection_timeout: config.listener.effective_idle_timeout(),
            connect_timeout: config.listener.effective_connect_timeout(),
            cache_cleanup_period: config.dns.effective_cache_cleanup_period(),
        },
        rate_limits: RateLimits {
            from_user_bytes_per_sec: config.limits.from_user_bytes_per_sec.unwrap_or(0),
            from_target_bytes_per_sec: config.limits.from_target_bytes_per_sec.unwrap_or(0),
        },
    })
}
