use std::{path::Path, sync::Arc};

use anyhow::{bail, Context, Result};
use bugfeed_runtime::{
    start_push_feed, AppliedChange, BugStore, JsonFileBugCache, LiveTimeline, PushFeed,
    PushFeedRuntimeConfig,
};
use bugfeed_timeline::{ChangeLine, Comment, FieldCatalog, FieldMetadata, Person};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::cli_args::{Cli, CliCommand};

pub(crate) async fn run_cli(cli: Cli) -> Result<()> {
    let config = cli.runtime.to_runtime_config();
    match cli.command {
        CliCommand::Watch { bugs } => run_watch(config, bugs).await,
        CliCommand::Timeline {
            bug,
            delayed,
            field_catalog,
        } => {
            let catalog = load_field_catalog(field_catalog.as_deref())?;
            let feed = start_push_feed(config)?;
            let report = render_timeline_report(&feed, bug, delayed, &catalog).await;
            feed.shutdown().await?;
            println!("{}", serde_json::to_string_pretty(&report?)?);
            Ok(())
        }
        CliCommand::MarkViewed { bug, at } => {
            let time = parse_viewed_at(at.as_deref())?;
            let store = open_store(&config)?;
            require_cached(bug, store.set_last_viewed(bug, time).await?)?;
            println!("{}", json!({"bug_id": bug, "last_viewed": time}));
            Ok(())
        }
        CliCommand::Star { bug, clear } => {
            let store = open_store(&config)?;
            require_cached(bug, store.toggle_star(bug, !clear).await?)?;
            println!("{}", json!({"bug_id": bug, "starred": !clear}));
            Ok(())
        }
        CliCommand::Unread { bug, clear } => {
            let store = open_store(&config)?;
            require_cached(bug, store.toggle_unread(bug, !clear).await?)?;
            println!("{}", json!({"bug_id": bug, "unread": !clear}));
            Ok(())
        }
    }
}

async fn run_watch(config: PushFeedRuntimeConfig, bugs: Vec<u64>) -> Result<()> {
    if config.websocket_endpoint.is_none() {
        tracing::warn!("no websocket endpoint configured; live updates are disabled");
    }
    let mut feed = start_push_feed(config)?;
    feed.channel.subscribe(bugs.iter().copied()).await?;
    feed.channel.connect().await?;
    tracing::info!(bugs = ?bugs, "watching bugs");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("watch shutdown requested");
                break;
            }
            change = feed.updates.recv() => {
                let Some(change) = change else {
                    break;
                };
                println!("{}", render_change_line(&change));
            }
        }
    }
    feed.shutdown().await
}

fn open_store(config: &PushFeedRuntimeConfig) -> Result<BugStore> {
    let cache = JsonFileBugCache::open(config.cache_dir.clone())?;
    Ok(BugStore::new(Arc::new(cache)))
}

fn require_cached(bug_id: u64, updated: bool) -> Result<()> {
    if !updated {
        bail!("bug {bug_id} is not cached; run `timeline {bug_id}` first");
    }
    Ok(())
}

fn parse_viewed_at(raw: Option<&str>) -> Result<DateTime<Utc>> {
    match raw {
        None => Ok(Utc::now()),
        Some(raw) => DateTime::parse_from_rfc3339(raw.trim())
            .map(|time| time.with_timezone(&Utc))
            .with_context(|| format!("invalid --at timestamp `{raw}`")),
    }
}

pub(crate) fn load_field_catalog(path: Option<&Path>) -> Result<FieldCatalog> {
    let Some(path) = path else {
        return Ok(FieldCatalog::new());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let fields = serde_json::from_str::<Vec<FieldMetadata>>(&raw)
        .with_context(|| format!("failed to parse field catalog {}", path.display()))?;
    Ok(FieldCatalog::from_fields(fields))
}

pub(crate) fn render_change_line(change: &AppliedChange) -> Value {
    json!({
        "bug_id": change.bug_id,
        "kind": change.kind.as_str(),
        "time": change.record.time(),
        "partial_fields": change.partial_fields(),
        "record": change.record,
    })
}

pub(crate) async fn render_timeline_report(
    feed: &PushFeed,
    bug_id: u64,
    delayed: bool,
    catalog: &FieldCatalog,
) -> Result<Value> {
    let (bug, fetched) = feed.load_bug(bug_id).await?;
    let live = LiveTimeline::from_bug(&bug, feed.sort_order(), delayed || fetched);
    let partition = live.partition();
    let entries = partition
        .entries
        .iter()
        .enumerate()
        .map(|(index, tagged)| {
            let changes = live
                .change_lines(index, catalog)
                .iter()
                .map(ChangeLine::render_plain)
                .collect::<Vec<_>>();
            json!({
                "time": tagged.entry.time,
                "state": tagged.state,
                "author": tagged.entry.author().map(Person::display_name),
                "also_by": tagged.entry.secondary_author().map(Person::display_name),
                "no_comment": tagged.entry.is_no_comment(),
                "comment": tagged.entry.comment.as_ref().map(Comment::body),
                "attachment": tagged
                    .entry
                    .attachment
                    .as_ref()
                    .map(|attachment| attachment.description.clone()),
                "changes": changes,
            })
        })
        .collect::<Vec<_>>();

    Ok(json!({
        "bug_id": bug.id,
        "summary": bug.summary(),
        "order": live.timeline().order().as_str(),
        "starred": bug.starred,
        "read_count": partition.read_count,
        "unread_count": partition.unread_count,
        "collapsed": partition.summary,
        "entries": entries,
    }))
}
