//! Swarm Node Agent - 单节点生命周期代理
//!
//! Usage:
//! - Normal mode: `swarm-node-agent`
//! - Custom data dir: `swarm-node-agent --data-dir /srv/node-agent`

use std::path::PathBuf;

use swarm_node_agent::RuntimeConfig;

/// 解析命令行参数
fn parse_args() -> RuntimeConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = RuntimeConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--data-dir" if i + 1 < args.len() => {
                config.data_dir = Some(PathBuf::from(&args[i + 1]));
                i += 2;
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {
                i += 1;
            }
        }
    }

    config
}

fn print_help() {
    println!("Swarm Node Agent - 单节点生命周期代理");
    println!();
    println!("USAGE:");
    println!("    swarm-node-agent [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    --data-dir <PATH>    Override the data directory");
    println!("    -h, --help           Print help information");
    println!();
    println!("ENVIRONMENT:");
    println!("    NODE_AGENT_DATA_DIR      Data directory (default /var/opt/node-agent)");
    println!("    NODE_AGENT_ISSUER_URL    Certificate issuer URL");
    println!("    NODE_AGENT_SWARM_NETWORK Overlay network name (default node_net)");
}

fn main() {
    let config = parse_args();

    let rt = tokio::runtime::Runtime::new().expect("Failed to create runtime");
    let exit_code = rt.block_on(async { swarm_node_agent::init_and_run_agent(config).await });
    std::process::exit(exit_code);
}
