use anyhow::{Context, Result, bail};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::alerts::Severity;
use crate::monitor::FleetMonitor;

pub async fn print_status(monitor: &FleetMonitor) -> Result<()> {
    let nodes = monitor.registry().snapshot().await;
    if nodes.is_empty() {
        println!("No nodes registered.");
        return Ok(());
    }

    println!(
        "{:<6} {:<20} {:<12} {:>11} {:>9} {:>8} {:<20}",
        "ID", "NAME", "STATUS", "LOAD", "LATENCY", "UPTIME", "LAST CHECK"
    );
    for node in nodes {
        let latency = node
            .last_latency_ms
            .map(|ms| format!("{}ms", ms))
            .unwrap_or_else(|| "-".to_string());
        let checked = node
            .last_checked
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "never".to_string());
        let status = if node.maintenance {
            format!("{}*", node.status)
        } else {
            node.status.to_string()
        };
        println!(
            "{:<6} {:<20} {:<12} {:>11} {:>9} {:>7.1}% {:<20}",
            node.id,
            node.name,
            status,
            format!("{}/{}", node.current_load, node.capacity),
            latency,
            node.uptime_pct,
            checked
        );
    }

    for group in monitor.registry().groups().await {
        println!(
            "group {} ({}): {:?}",
            group.name, group.policy, group.node_ids
        );
    }
    Ok(())
}

pub async fn set_maintenance(monitor: &FleetMonitor, node_id: i64, on: bool) -> Result<()> {
    let (from, to) = monitor
        .registry()
        .set_maintenance(node_id, on)
        .await
        .with_context(|| format!("Failed to update node {}", node_id))?;
    println!("Node {}: {} -> {}", node_id, from, to);
    if from != to {
        monitor.alerts().notify(
            Severity::Warning,
            &format!("Node #{}: {} -> {} (administrator)", node_id, from, to),
        );
    }
    Ok(())
}

/// Queues a release for the running server, which applies it at the start
/// of its next probe cycle. Failover phases live in the server process.
pub async fn release(monitor: &FleetMonitor, node_id: i64) -> Result<()> {
    let node = monitor
        .registry()
        .node(node_id)
        .await
        .with_context(|| format!("Unknown node {}", node_id))?;
    monitor
        .store()
        .request_release(node_id)
        .await
        .with_context(|| format!("Failed to queue release of node {}", node_id))?;
    println!(
        "Release of node {} ({}) queued; the server applies it on its next probe cycle.",
        node.id, node.name
    );
    Ok(())
}

/// Parameters of the generated systemd unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceUnit {
    pub name: String,
    pub after: Vec<String>,
    pub exe: PathBuf,
    pub workdir: PathBuf,
}

impl ServiceUnit {
    pub fn path(&self) -> PathBuf {
        Path::new("/etc/systemd/system").join(format!("{}.service", self.name))
    }

    pub fn render(&self) -> String {
        let mut after = vec!["network-online.target".to_string()];
        after.extend(self.after.iter().cloned());
        format!(
            r#"[Unit]
Description=Caramba fleet monitor ({name})
Wants=network-online.target
After={after}

[Service]
Type=simple
WorkingDirectory={workdir}
EnvironmentFile=-{workdir}/.env
ExecStart={exe} serve
Restart=on-failure
RestartSec=5
KillSignal=SIGINT

[Install]
WantedBy=multi-user.target
"#,
            name = self.name,
            after = after.join(" "),
            workdir = self.workdir.display(),
            exe = self.exe.display(),
        )
    }
}

pub fn install_service(name: &str, after: &[String]) -> Result<()> {
    if name.is_empty() || name.contains('/') {
        bail!("Invalid service name {:?}", name);
    }
    let unit = ServiceUnit {
        name: name.to_string(),
        after: after.to_vec(),
        exe: env::current_exe().context("Cannot locate the running executable")?,
        workdir: env::current_dir().context("Cannot read the working directory")?,
    };

    if unsafe { libc::getuid() } != 0 {
        bail!("Installing a systemd unit requires root");
    }

    let path = unit.path();
    fs::write(&path, unit.render())
        .with_context(|| format!("Failed to write {}", path.display()))?;

    println!("Installed {}", path.display());
    println!("  systemctl daemon-reload && systemctl enable --now {}", unit.name);
    Ok(())
}
