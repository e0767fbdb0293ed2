use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{ToolContext, ToolOutcome};
use crate::state::StateDelta;
use crate::store::{FragmentUpdate, ProgressUpdate};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct FileSpec {
    path: String,
    content: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct CreateOrUpdateArgs {
    files: Vec<FileSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct ReadFilesArgs {
    files: Vec<String>,
}

#[derive(Debug, Serialize)]
struct FileContent<'a> {
    path: &'a str,
    content: String,
}

/// Write files in list order and mirror the merged map into the fragment.
///
/// Writes that landed before a failure are kept in the delta.
pub(super) async fn create_or_update(args: CreateOrUpdateArgs, ctx: &ToolContext<'_>) -> ToolOutcome {
    ctx.progress.action("Creating and updating files").await;

    let mut delta = StateDelta::default();
    let mut error = None;
    for file in args.files {
        if file.path.trim().is_empty() {
            error = Some("file path must not be empty".to_string());
            break;
        }
        match ctx.sandbox.write_file(&file.path, &file.content).await {
            Ok(()) => delta.files.push((file.path, file.content)),
            Err(e) => {
                error = Some(format!("failed to write {}: {e}", file.path));
                break;
            }
        }
    }

    if !delta.is_empty() {
        let mut merged = ctx.files.clone();
        merged.extend(delta.files.iter().cloned());
        ctx.progress
            .update(ProgressUpdate::new().fragment(FragmentUpdate::default().files(merged)))
            .await;
    }

    let output = match error {
        Some(message) => {
            warn!(written = delta.files.len(), %message, "File write failed");
            ctx.progress.failure(format!("Error: {message}")).await;
            format!("Error: {message}")
        }
        None => {
            let paths: Vec<&str> = delta.files.iter().map(|(p, _)| p.as_str()).collect();
            format!("Updated {} file(s): {}", paths.len(), paths.join(", "))
        }
    };
    ToolOutcome { output, delta }
}

/// Read every requested path. Any failure fails the whole call.
pub(super) async fn read(args: ReadFilesArgs, ctx: &ToolContext<'_>) -> ToolOutcome {
    ctx.progress.action("Reading files").await;

    let mut contents = Vec::with_capacity(args.files.len());
    for path in &args.files {
        match ctx.sandbox.read_file(path).await {
            Ok(content) => contents.push(FileContent { path, content }),
            Err(e) => {
                let message = format!("Error: failed to read {path}: {e}");
                ctx.progress.failure(message.clone()).await;
                return ToolOutcome::output(message);
            }
        }
    }

    match serde_json::to_string(&contents) {
        Ok(json) => ToolOutcome::output(json),
        Err(e) => ToolOutcome::output(format!("Error: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::mock::MockSandbox;
    use crate::store::{InMemoryStore, MessageType, NewProgressRecord, ProgressStore};
    use crate::tools::ProgressReporter;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use uuid::Uuid;

    async fn reporter() -> (Arc<InMemoryStore>, ProgressReporter) {
        let store = Arc::new(InMemoryStore::new());
        let id = Uuid::new_v4();
        store
            .create_record(NewProgressRecord::placeholder(id, "t", "u", "x"))
            .await
            .unwrap();
        (store.clone(), ProgressReporter::new(store, id))
    }

    fn specs(files: &[(&str, &str)]) -> CreateOrUpdateArgs {
        CreateOrUpdateArgs {
            files: files
                .iter()
                .map(|(p, c)| FileSpec {
                    path: (*p).to_string(),
                    content: (*c).to_string(),
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_writes_in_order_and_mirrors_fragment() {
        let (store, progress) = reporter().await;
        let sandbox = MockSandbox::new();
        let session = sandbox.session();
        let mut existing = BTreeMap::new();
        existing.insert("app/layout.tsx".to_string(), "layout".to_string());
        let ctx = ToolContext {
            sandbox: &session,
            progress: &progress,
            files: &existing,
        };

        let outcome = create_or_update(
            specs(&[("app/page.tsx", "v1"), ("app/page.tsx", "v2")]),
            &ctx,
        )
        .await;
        assert!(outcome.output.starts_with("Updated 2 file(s)"));
        assert_eq!(outcome.delta.files.len(), 2);
        assert_eq!(sandbox.files()["app/page.tsx"], "v2");

        let record = store.get_record(progress.record_id()).await.unwrap().unwrap();
        let fragment = record.fragment.unwrap();
        assert_eq!(fragment.files.len(), 2);
        assert_eq!(fragment.files["app/page.tsx"], "v2");
        assert_eq!(fragment.files["app/layout.tsx"], "layout");
        assert_eq!(record.content, "Creating and updating files");
    }

    #[tokio::test]
    async fn test_partial_writes_are_kept_on_failure() {
        let (store, progress) = reporter().await;
        let sandbox = MockSandbox::new();
        sandbox.fail_path("b.txt");
        let session = sandbox.session();
        let files = BTreeMap::new();
        let ctx = ToolContext {
            sandbox: &session,
            progress: &progress,
            files: &files,
        };

        let outcome = create_or_update(specs(&[("a.txt", "1"), ("b.txt", "2"), ("c.txt", "3")]), &ctx).await;
        assert!(outcome.output.starts_with("Error: failed to write b.txt"));
        assert_eq!(outcome.delta.files, vec![("a.txt".to_string(), "1".to_string())]);
        assert!(!sandbox.files().contains_key("c.txt"));

        let record = store.get_record(progress.record_id()).await.unwrap().unwrap();
        assert_eq!(record.message_type, MessageType::Error);
        assert_eq!(record.fragment.unwrap().files.len(), 1);
    }

    #[tokio::test]
    async fn test_read_returns_structured_list() {
        let (_store, progress) = reporter().await;
        let sandbox = MockSandbox::new();
        sandbox.seed_file("package.json", "{}");
        sandbox.seed_file("app/page.tsx", "page");
        let session = sandbox.session();
        let files = BTreeMap::new();
        let ctx = ToolContext {
            sandbox: &session,
            progress: &progress,
            files: &files,
        };

        let outcome = read(
            ReadFilesArgs {
                files: vec!["package.json".to_string(), "app/page.tsx".to_string()],
            },
            &ctx,
        )
        .await;
        let parsed: serde_json::Value = serde_json::from_str(&outcome.output).unwrap();
        assert_eq!(parsed[0]["path"], "package.json");
        assert_eq!(parsed[1]["content"], "page");
    }

    #[tokio::test]
    async fn test_read_fails_closed() {
        let (_store, progress) = reporter().await;
        let sandbox = MockSandbox::new();
        sandbox.seed_file("package.json", "{}");
        let session = sandbox.session();
        let files = BTreeMap::new();
        let ctx = ToolContext {
            sandbox: &session,
            progress: &progress,
            files: &files,
        };

        let outcome = read(
            ReadFilesArgs {
                files: vec!["package.json".to_string(), "missing.ts".to_string()],
            },
            &ctx,
        )
        .await;
        assert!(outcome.output.starts_with("Error: failed to read missing.ts"));
        assert!(!outcome.output.contains("package.json"));
    }
}
