//! Status command implementation.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use deskbridge_core::capability::LivenessDiscovery;
use deskbridge_core::contacts::AddressBook;
use deskbridge_core::status::{HttpDiscovery, PeerStatus, StatusProbe, StatusReport};

use super::StatusArgs;

/// Run the status command.
pub async fn run(args: StatusArgs, path: &Path) -> Result<()> {
    let config = super::load_config(path);
    let book = AddressBook::load().context("Failed to load address book")?;

    let ids = if args.identifiers.is_empty() {
        book.list().iter().map(|c| c.identifier.clone()).collect()
    } else {
        args.identifiers.clone()
    };
    if ids.is_empty() {
        println!("Nothing to check: add contacts or pass identifiers.");
        return Ok(());
    }

    if config.broker.is_cloud() && !args.json {
        println!("The public broker has no peer list; everyone will show as offline.");
        println!("Point broker.host at a self-hosted broker for live status.");
        println!();
    }

    let discovery: Arc<dyn LivenessDiscovery> =
        Arc::new(HttpDiscovery::new(config.status.query_timeout));
    let probe = Arc::new(StatusProbe::new(
        config.broker.clone(),
        config.status.clone(),
        discovery,
    ));

    if !args.watch {
        let report = probe.check(&ids).await.unwrap_or_default();
        return output(&report, &book, args.json);
    }

    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel(1);
    let task = {
        let probe = Arc::clone(&probe);
        let cancel = cancel.clone();
        tokio::spawn(async move { probe.run(ids, cancel, tx).await })
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                debug!("Interrupted, stopping status watch");
                break;
            }
            report = rx.recv() => {
                let Some(report) = report else { break };
                output(&report, &book, args.json)?;
                if !args.json {
                    println!();
                }
            }
        }
    }

    cancel.cancel();
    drop(rx);
    task.await.context("Status probe task failed")?;
    Ok(())
}

fn output(report: &StatusReport, book: &AddressBook, json: bool) -> Result<()> {
    if json {
        return super::print_json(&serde_json::to_value(report)?);
    }

    let online = report.values().filter(|s| **s == PeerStatus::Online).count();
    println!("{online} of {} online", report.len());
    for (id, status) in report {
        let name = book.get(id).map_or(id.as_str(), |c| c.display_name());
        let marker = match status {
            PeerStatus::Online => "●",
            PeerStatus::Offline => "○",
        };
        if name == id {
            println!("  {marker} {id:10}  {status}");
        } else {
            println!("  {marker} {id:10}  {status:8} {name}");
        }
    }
    Ok(())
}
