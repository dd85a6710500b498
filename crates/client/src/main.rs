use clap::{Parser, Subcommand};
use portlease_common::{
    AllocateRequest, AllocateResponse, ErrorResponse, HeartbeatRequest, PortHint, PortsResponse,
    ReleaseRequest, ReservationEntry, MAIN_LABEL,
};
use reqwest::Client;
use std::collections::BTreeMap;
use std::process::{Command, Stdio};
use std::time::Duration;
use tokio::time;

const MAX_HEARTBEAT_SECS: u64 = 60;

#[derive(Parser)]
#[command(name = "portlease", author, version, about, long_about = None)]
struct Cli {
    /// Daemon base URL
    #[arg(long, env = "PORTLEASE_URL", default_value = "http://localhost:5555", global = true)]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Clone)]
struct PortArgs {
    /// Preferred port for a single-port reservation
    #[arg(long)]
    hint: Option<u16>,

    /// Named ports, e.g. `main=3100,api,ws=3102`
    #[arg(long, value_parser = parse_port_spec, conflicts_with_all = ["hint", "count"])]
    ports: Option<BTreeMap<String, PortHint>>,

    /// Number of ports, labeled 0..N-1
    #[arg(long, conflicts_with = "hint")]
    count: Option<usize>,

    /// Lease in seconds
    #[arg(long)]
    lease: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Reserve one or more ports for a service
    Reserve {
        name: String,

        #[command(flatten)]
        ports: PortArgs,

        /// Owning process id (defaults to none, reclaimed only by expiry)
        #[arg(long)]
        pid: Option<u32>,
    },
    /// Release a service's ports, or one labeled port
    Release {
        name: String,
        #[arg(long)]
        label: Option<String>,
    },
    /// Extend a service's lease
    Heartbeat { name: String },
    /// List all reservations
    List,
    /// Print the ports held by a service
    Ports { name: String },
    /// Run a command with reserved ports in its environment
    Run {
        /// Service name for the reservation
        name: String,

        #[command(flatten)]
        ports: PortArgs,

        /// Environment variable name for the port (default: PORT)
        #[arg(long, default_value = "PORT")]
        env_name: String,

        /// Command and arguments to execute
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

/// Parses `label[=port]` pairs separated by commas.
fn parse_port_spec(spec: &str) -> Result<BTreeMap<String, PortHint>, String> {
    let mut ports = BTreeMap::new();
    for item in spec.split(',').map(str::trim).filter(|item| !item.is_empty()) {
        let (label, hint) = match item.split_once('=') {
            Some((label, port)) => {
                let port = port
                    .trim()
                    .parse::<u16>()
                    .map_err(|e| format!("invalid port for '{}': {}", label, e))?;
                (label.trim(), Some(port))
            }
            None => (item, None),
        };
        if label.is_empty() {
            return Err(format!("missing label in '{}'", item));
        }
        ports.insert(label.to_string(), PortHint::Bare(hint));
    }
    if ports.is_empty() {
        return Err("no ports given".to_string());
    }
    Ok(ports)
}

fn allocate_request(name: &str, args: PortArgs, pid: Option<u32>) -> AllocateRequest {
    AllocateRequest {
        name: Some(name.to_string()),
        hint: args.hint,
        ports: args.ports,
        count: args.count,
        pid,
        lease: args.lease,
    }
}

/// Environment variables for a reservation: `PORT` for the primary port, plus
/// `PORT_<LABEL>` for each label of a multi-port reservation.
fn port_env(env_name: &str, alloc: &AllocateResponse) -> Vec<(String, String)> {
    let mut vars = vec![(env_name.to_string(), alloc.port.to_string())];
    if let Some(ports) = &alloc.ports {
        for (label, port) in ports {
            let suffix: String = label
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
                .collect();
            vars.push((format!("{}_{}", env_name, suffix), port.to_string()));
        }
    }
    vars
}

/// Heartbeat often enough to renew a lease of `lease_secs` well before it runs out.
fn heartbeat_period(lease_secs: u64) -> Duration {
    Duration::from_secs((lease_secs / 3).clamp(1, MAX_HEARTBEAT_SECS))
}

async fn reserve(
    client: &Client,
    base_url: &str,
    req: &AllocateRequest,
) -> Result<AllocateResponse, Box<dyn std::error::Error>> {
    let resp = client
        .post(format!("{}/reserve", base_url))
        .json(req)
        .send()
        .await?;

    if resp.status().is_success() {
        Ok(resp.json().await?)
    } else {
        let status = resp.status();
        let message = match resp.json::<ErrorResponse>().await {
            Ok(body) => body.error,
            Err(_) => status.to_string(),
        };
        Err(format!("Failed to reserve ports: {}", message).into())
    }
}

fn print_allocation(name: &str, alloc: &AllocateResponse) {
    match &alloc.ports {
        Some(ports) => {
            println!("Ports reserved for {}:", name);
            for (label, port) in ports {
                println!("  {}: {}", label, port);
            }
        }
        None => println!("Reserved port {} for {}", alloc.port, name),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = Client::new();
    let base_url = cli.url.trim_end_matches('/').to_string();

    match cli.command {
        Commands::Reserve { name, ports, pid } => {
            let req = allocate_request(&name, ports, pid);
            let alloc = reserve(&client, &base_url, &req).await?;
            print_allocation(&name, &alloc);
        }
        Commands::Release { name, label } => {
            let req = ReleaseRequest {
                name: Some(name.clone()),
                label: label.clone(),
            };
            let resp = client
                .post(format!("{}/release", base_url))
                .json(&req)
                .send()
                .await?;

            if resp.status().is_success() {
                match label {
                    Some(label) => println!("Released {} port of {}", label, name),
                    None => println!("Released all ports of {}", name),
                }
            } else {
                eprintln!("Failed to release ports: {}", resp.status());
                std::process::exit(1);
            }
        }
        Commands::Heartbeat { name } => {
            let req = HeartbeatRequest { name: Some(name) };
            let resp = client
                .post(format!("{}/heartbeat", base_url))
                .json(&req)
                .send()
                .await?;
            if !resp.status().is_success() {
                eprintln!("Heartbeat failed: {}", resp.status());
                std::process::exit(1);
            }
        }
        Commands::List => {
            let resp = client.get(format!("{}/list", base_url)).send().await?;

            if resp.status().is_success() {
                let entries: Vec<ReservationEntry> = resp.json().await?;
                println!("Reservations:");
                for entry in entries {
                    let ports: Vec<String> = entry
                        .ports
                        .iter()
                        .map(|(label, port)| format!("{}={}", label, port))
                        .collect();
                    println!(
                        "{}: {} (pid: {}, expires: {}, {})",
                        entry.name,
                        ports.join(", "),
                        entry.pid.map_or_else(|| "-".to_string(), |pid| pid.to_string()),
                        entry.expires_at.to_rfc3339(),
                        if entry.alive { "alive" } else { "stale" }
                    );
                }
            } else {
                eprintln!("Failed to list reservations: {}", resp.status());
            }
        }
        Commands::Ports { name } => {
            let resp = client
                .get(format!("{}/ports/{}", base_url, name))
                .send()
                .await?;

            if resp.status().is_success() {
                let lookup: PortsResponse = resp.json().await?;
                if lookup.ports.len() == 1 {
                    if let Some(port) = lookup.ports.get(MAIN_LABEL) {
                        println!("{}", port);
                        return Ok(());
                    }
                }
                for (label, port) in &lookup.ports {
                    println!("{}={}", label, port);
                }
            } else {
                eprintln!("No ports found for service: {}", name);
                std::process::exit(1);
            }
        }
        Commands::Run { name, ports, env_name, command } => {
            if command.is_empty() {
                eprintln!("No command specified");
                std::process::exit(1);
            }

            // This process owns the lease for as long as the child runs.
            let req = allocate_request(&name, ports, Some(std::process::id()));
            let alloc = match reserve(&client, &base_url, &req).await {
                Ok(alloc) => alloc,
                Err(e) => {
                    eprintln!("{}", e);
                    std::process::exit(1);
                }
            };
            print_allocation(&name, &alloc);

            let heartbeat_client = client.clone();
            let heartbeat_url = format!("{}/heartbeat", base_url);
            let heartbeat_name = name.clone();
            let period = heartbeat_period(alloc.lease);
            let heartbeat_handle = tokio::spawn(async move {
                let mut interval = time::interval(period);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    let hb_req = HeartbeatRequest {
                        name: Some(heartbeat_name.clone()),
                    };
                    match heartbeat_client.post(&heartbeat_url).json(&hb_req).send().await {
                        Ok(r) if r.status().is_success() => {}
                        Ok(r) => eprintln!("Heartbeat failed: {}", r.status()),
                        Err(e) => eprintln!("Heartbeat error: {}", e),
                    }
                }
            });

            let cmd = &command[0];
            let args = &command[1..];
            let vars = port_env(&env_name, &alloc);

            println!("Running: {} {:?} with {}={}", cmd, args, env_name, alloc.port);

            let mut child = Command::new(cmd);
            child
                .args(args)
                .envs(vars)
                .stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit());
            let status = tokio::task::spawn_blocking(move || child.status()).await?;

            heartbeat_handle.abort();

            // Expiry and the daemon's liveness sweep reclaim the ports anyway;
            // releasing here only frees them sooner.
            let rel_req = ReleaseRequest {
                name: Some(name.clone()),
                label: None,
            };
            let _ = client
                .post(format!("{}/release", base_url))
                .json(&rel_req)
                .send()
                .await;
            println!("Released ports of {}", name);

            match status {
                Ok(s) => {
                    if !s.success() {
                        std::process::exit(s.code().unwrap_or(1));
                    }
                }
                Err(e) => {
                    eprintln!("Failed to run command: {}", e);
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_spec_parses_labels_and_hints() {
        let ports = parse_port_spec("main=3100, api,ws=3102").unwrap();
        assert_eq!(ports.len(), 3);
        assert_eq!(ports["main"].port(), Some(3100));
        assert_eq!(ports["api"].port(), None);
        assert_eq!(ports["ws"].port(), Some(3102));
    }

    #[test]
    fn port_spec_rejects_bad_input() {
        assert!(parse_port_spec("").is_err());
        assert!(parse_port_spec("=3000").is_err());
        assert!(parse_port_spec("main=notaport").is_err());
    }

    #[test]
    fn multi_port_env_has_per_label_vars() {
        let alloc = AllocateResponse {
            port: 3000,
            ports: Some(BTreeMap::from([
                ("main".to_string(), 3000),
                ("web-socket".to_string(), 3001),
            ])),
            lease: 600,
        };
        let vars = port_env("PORT", &alloc);
        assert!(vars.contains(&("PORT".to_string(), "3000".to_string())));
        assert!(vars.contains(&("PORT_MAIN".to_string(), "3000".to_string())));
        assert!(vars.contains(&("PORT_WEB_SOCKET".to_string(), "3001".to_string())));
    }

    #[test]
    fn cli_rejects_hint_with_named_ports() {
        let parsed = Cli::try_parse_from([
            "portlease", "reserve", "svc", "--hint", "3000", "--ports", "main",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn heartbeat_period_follows_granted_lease() {
        assert_eq!(heartbeat_period(600), Duration::from_secs(60));
        assert_eq!(heartbeat_period(30), Duration::from_secs(10));
        assert_eq!(heartbeat_period(2), Duration::from_secs(1));
        assert_eq!(heartbeat_period(0), Duration::from_secs(1));
    }
}
