//! Purpose: Hold top-level CLI command dispatch for `pagewise`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: Each command writes exactly one JSON document to stdout on success.
//! Invariants: Helpers in `main.rs` remain the source of command business logic.

use super::*;

use pagewise::api::PaginationState;
use pagewise::api::wire::ListRequest;
use pagewise::catalog::{Catalog, read_seed};

pub(super) fn dispatch_command(command: Command) -> Result<RunOutcome, Error> {
    match command {
        Command::Completion { shell } => {
            let mut cmd = Cli::command();
            clap_complete::aot::generate(shell, &mut cmd, "pagewise", &mut io::stdout());
            Ok(RunOutcome::ok())
        }
        Command::Serve(args) => {
            let config = serve::ServeConfig {
                bind: parse_bind(&args.bind)?,
                catalog: args.catalog,
                token: args.token,
                allow_non_loopback: args.allow_non_loopback,
                max_body_bytes: args.max_body_bytes,
                cors_origins: args.cors_origins,
            };
            runtime()?.block_on(serve::serve(config))?;
            Ok(RunOutcome::ok())
        }
        Command::Check { catalog } => {
            let catalog = Catalog::load(&catalog)?;
            emit_json(json!({ "collections": catalog.info() }));
            Ok(RunOutcome::ok())
        }
        Command::Fetch {
            target,
            query,
            limit,
            after,
            before,
            state_at,
        } => {
            let collection = target.collection()?;
            let mut query = query.query()?;
            if let Some(state_at) = state_at {
                query = query.at_state(state_at);
            }
            let bounds = RangeBounds { after, before };
            let response = collection.list(&ListRequest::new(&query, &bounds, limit))?;
            let value = serde_json::to_value(&response).map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message("failed to encode page")
                    .with_source(err)
            })?;
            emit_json(value);
            Ok(RunOutcome::ok())
        }
        Command::Browse {
            target,
            query,
            limit,
            pages,
            period,
        } => {
            let collection = target.collection()?;
            let query = query.query()?;
            let cache = browse_cache(collection, limit);
            let snapshot = runtime()?.block_on(async {
                match period {
                    Some(period) => {
                        cache
                            .load_period(&query, Arc::new(Period::from(period)))
                            .await
                    }
                    None => {
                        let mut snapshot = cache.load(&query).await?;
                        for _ in 1..pages.max(1) {
                            if snapshot.is_complete() {
                                break;
                            }
                            snapshot = cache.load_more(&query).await?;
                        }
                        Ok(snapshot)
                    }
                }
            })?;
            if snapshot.state == Some(PaginationState::Limited) {
                emit_notice(&limited_notice(&target.collection, &snapshot));
            }
            emit_json(snapshot_json(&snapshot, cache.source().fetches()));
            Ok(RunOutcome::ok())
        }
        Command::Append { target, file } => {
            let collection = target.collection()?;
            let records = read_seed(&file)?;
            let receipt = collection.append(records)?;
            emit_json(json!({ "inserted": receipt.inserted, "state_at": receipt.state_at }));
            Ok(RunOutcome::ok())
        }
    }
}
