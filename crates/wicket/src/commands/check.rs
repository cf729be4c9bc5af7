use std::path::PathBuf;
use std::sync::Arc;

use wicket_proxy::{DnsResolver, ProxyServer, SystemResolver};
use wicket_settings::ConfigLoader;

use crate::commands::run::server_config_from;
use crate::error::CliError;

pub async fn check(cwd: PathBuf) -> Result<(), CliError> {
    let mut all_ok = true;

    // 1. Platform info
    println!("Platform: {}", std::env::consts::OS);
    println!("Architecture: {}", std::env::consts::ARCH);

    // 2. Config
    print!("Config: ");
    let config = ConfigLoader::load(&cwd);
    match config.validate() {
        Ok(()) => println!("OK"),
        Err(e) => {
            println!("FAIL — {e}");
            all_ok = false;
        }
    }

    // 3. Proxy smoke-test on an OS-assigned port
    print!("Proxy: ");
    match server_config_from(&config) {
        Ok(mut server_config) => {
            server_config.bind_addr = "127.0.0.1:0"
                .parse()
                .expect("hardcoded loopback address");
            let (dns, _stats, _dns_join) = DnsResolver::spawn(
                Arc::new(SystemResolver),
                config.dns.effective_cache_cleanup_period(),
            );
            match ProxyServer::new(server_config, dns) {
                Ok(server) => match server.start().await {
                    Ok(handle) => {
                        handle.shutdown().await;
                        println!("OK");
                    }
                    Err(e) => {
                        println!("FAIL (start) — {e}");
                        all_ok = false;
                    }
                },
                Err(e) => {
                    println!("FAIL (init) — {e}");
                    all_ok = false;
                }
            }
        }
        Err(e) => {
            println!("FAIL (config) — {e}");
            all_ok = false;
        }
    }

    // 4. Config file locations
    let global_path = ConfigLoader::global_config_path();
    println!(
        "Global config: {} ({})",
        global_path.display(),
        if global_path.exists() { "present" } else { "absent" }
    );
    let project_path = ConfigLoader::project_config_path(&cwd);
    println!(
        "Project config: {} ({})",
        project_path.display(),
        if project_path.exists() { "present" } else { "absent" }
    );

    if all_ok {
        Ok(())
    } else {
        Err(CliError::Other("check failed".to_string()))
    }
}
