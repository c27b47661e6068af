//! Tool handlers and registry.
//!
//! Each tool resolves its session handle (which refreshes, touches and
//! rate-limits in one step) before delegating to the API client. Results
//! flow back as the raw JSON Taiga returned - the bridge adds no domain
//! modeling of its own.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::auth::{Authenticator, CredentialKind};
use crate::error::{BridgeError, Result};

use super::metrics::MetricsRecorder;

pub struct ToolContext {
    pub auth: Arc<Authenticator>,
    pub metrics: Arc<MetricsRecorder>,
}

/// A tool exposed over MCP.
pub struct ToolDef {
    pub name: &'static str,
    pub description: &'static str,
    pub schema: Value,
}

fn schema(required: &[&str], properties: Value) -> Value {
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

fn session_schema(extra_required: &[&str], mut extra_props: Value) -> Value {
    let mut props = json!({
        "session_id": {"type": "string", "description": "Handle returned by a login tool"}
    });
    if let (Some(base), Some(extra)) = (props.as_object_mut(), extra_props.as_object_mut()) {
        base.append(extra);
    }
    let mut required = vec!["session_id"];
    required.extend_from_slice(extra_required);
    schema(&required, props)
}

pub fn tool_definitions() -> Vec<ToolDef> {
    vec![
        ToolDef {
            name: "login",
            description: "Log into a Taiga instance with username/password; returns a session_id for subsequent calls.",
            schema: schema(
                &["host", "username", "password"],
                json!({
                    "host": {"type": "string"},
                    "username": {"type": "string"},
                    "password": {"type": "string"},
                }),
            ),
        },
        ToolDef {
            name: "login_with_token",
            description: "Log into a Taiga instance with a Bearer or Application token.",
            schema: schema(
                &["host", "token"],
                json!({
                    "host": {"type": "string"},
                    "token": {"type": "string"},
                    "token_type": {"type": "string", "enum": ["Bearer", "Application"]},
                    "user_id": {"type": "integer"},
                }),
            ),
        },
        ToolDef {
            name: "login_from_cache",
            description: "Authenticate using a token previously saved with save_session_token.",
            schema: schema(
                &["host"],
                json!({
                    "host": {"type": "string"},
                    "identifier": {"type": "string", "description": "Cache label, defaults to 'default'"},
                }),
            ),
        },
        ToolDef {
            name: "logout",
            description: "Invalidate a session_id. Safe to call twice.",
            schema: session_schema(&[], json!({})),
        },
        ToolDef {
            name: "session_status",
            description: "Report whether a session_id is live, its host, subject and remaining lifetime.",
            schema: session_schema(&[], json!({})),
        },
        ToolDef {
            name: "save_session_token",
            description: "Persist the session's token to the local cache so passwords are no longer needed.",
            schema: session_schema(&[], json!({"identifier": {"type": "string"}})),
        },
        ToolDef {
            name: "delete_cached_token",
            description: "Delete a cached token for a host.",
            schema: schema(
                &["host"],
                json!({"host": {"type": "string"}, "identifier": {"type": "string"}}),
            ),
        },
        ToolDef {
            name: "list_cached_tokens",
            description: "List cached tokens without revealing token values.",
            schema: schema(&[], json!({})),
        },
        ToolDef {
            name: "health_check",
            description: "Verify the session is live and the remote API answers for its credential.",
            schema: session_schema(&[], json!({})),
        },
        ToolDef {
            name: "get_server_metrics",
            description: "Per-tool request counts, error rates and response times since startup.",
            schema: schema(&[], json!({})),
        },
        ToolDef {
            name: "list_projects",
            description: "List projects the authenticated user is a member of.",
            schema: session_schema(&[], json!({})),
        },
        ToolDef {
            name: "get_project",
            description: "Fetch one project by id.",
            schema: session_schema(&["project_id"], json!({"project_id": {"type": "integer"}})),
        },
        ToolDef {
            name: "create_project",
            description: "Create a project. 'data' carries the project fields (name, description, ...).",
            schema: session_schema(&["data"], json!({"data": {"type": "object"}})),
        },
        ToolDef {
            name: "update_project",
            description: "Patch a project. Requires its current version; a concurrent edit surfaces as a version conflict.",
            schema: session_schema(
                &["project_id", "version", "data"],
                json!({
                    "project_id": {"type": "integer"},
                    "version": {"type": "integer"},
                    "data": {"type": "object"},
                }),
            ),
        },
        ToolDef {
            name: "delete_project",
            description: "Delete a project by id.",
            schema: session_schema(&["project_id"], json!({"project_id": {"type": "integer"}})),
        },
        ToolDef {
            name: "list_user_stories",
            description: "List user stories in a project.",
            schema: session_schema(&["project_id"], json!({"project_id": {"type": "integer"}})),
        },
        ToolDef {
            name: "get_user_story",
            description: "Fetch one user story by id.",
            schema: session_schema(&["user_story_id"], json!({"user_story_id": {"type": "integer"}})),
        },
        ToolDef {
            name: "create_user_story",
            description: "Create a user story in a project.",
            schema: session_schema(
                &["project_id", "data"],
                json!({"project_id": {"type": "integer"}, "data": {"type": "object"}}),
            ),
        },
        ToolDef {
            name: "update_user_story",
            description: "Patch a user story, carrying its current version.",
            schema: session_schema(
                &["user_story_id", "version", "data"],
                json!({
                    "user_story_id": {"type": "integer"},
                    "version": {"type": "integer"},
                    "data": {"type": "object"},
                }),
            ),
        },
        ToolDef {
            name: "delete_user_story",
            description: "Delete a user story by id.",
            schema: session_schema(&["user_story_id"], json!({"user_story_id": {"type": "integer"}})),
        },
        ToolDef {
            name: "list_tasks",
            description: "List tasks in a project.",
            schema: session_schema(&["project_id"], json!({"project_id": {"type": "integer"}})),
        },
        ToolDef {
            name: "get_task",
            description: "Fetch one task by id.",
            schema: session_schema(&["task_id"], json!({"task_id": {"type": "integer"}})),
        },
        ToolDef {
            name: "create_task",
            description: "Create a task in a project.",
            schema: session_schema(
                &["project_id", "data"],
                json!({"project_id": {"type": "integer"}, "data": {"type": "object"}}),
            ),
        },
        ToolDef {
            name: "update_task",
            description: "Patch a task, carrying its current version.",
            schema: session_schema(
                &["task_id", "version", "data"],
                json!({
                    "task_id": {"type": "integer"},
                    "version": {"type": "integer"},
                    "data": {"type": "object"},
                }),
            ),
        },
        ToolDef {
            name: "delete_task",
            description: "Delete a task by id.",
            schema: session_schema(&["task_id"], json!({"task_id": {"type": "integer"}})),
        },
        ToolDef {
            name: "list_issues",
            description: "List issues in a project.",
            schema: session_schema(&["project_id"], json!({"project_id": {"type": "integer"}})),
        },
        ToolDef {
            name: "get_issue",
            description: "Fetch one issue by id.",
            schema: session_schema(&["issue_id"], json!({"issue_id": {"type": "integer"}})),
        },
        ToolDef {
            name: "create_issue",
            description: "Create an issue in a project.",
            schema: session_schema(
                &["project_id", "data"],
                json!({"project_id": {"type": "integer"}, "data": {"type": "object"}}),
            ),
        },
        ToolDef {
            name: "update_issue",
            description: "Patch an issue, carrying its current version.",
            schema: session_schema(
                &["issue_id", "version", "data"],
                json!({
                    "issue_id": {"type": "integer"},
                    "version": {"type": "integer"},
                    "data": {"type": "object"},
                }),
            ),
        },
        ToolDef {
            name: "delete_issue",
            description: "Delete an issue by id.",
            schema: session_schema(&["issue_id"], json!({"issue_id": {"type": "integer"}})),
        },
        ToolDef {
            name: "list_milestones",
            description: "List milestones (sprints) in a project.",
            schema: session_schema(&["project_id"], json!({"project_id": {"type": "integer"}})),
        },
        ToolDef {
            name: "get_milestone",
            description: "Fetch one milestone by id.",
            schema: session_schema(&["milestone_id"], json!({"milestone_id": {"type": "integer"}})),
        },
        ToolDef {
            name: "list_epics",
            description: "List epics in a project.",
            schema: session_schema(&["project_id"], json!({"project_id": {"type": "integer"}})),
        },
        ToolDef {
            name: "get_epic",
            description: "Fetch one epic by id.",
            schema: session_schema(&["epic_id"], json!({"epic_id": {"type": "integer"}})),
        },
        ToolDef {
            name: "list_wiki_pages",
            description: "List wiki pages in a project.",
            schema: session_schema(&["project_id"], json!({"project_id": {"type": "integer"}})),
        },
        ToolDef {
            name: "get_wiki_page",
            description: "Fetch one wiki page by id.",
            schema: session_schema(&["page_id"], json!({"page_id": {"type": "integer"}})),
        },
    ]
}

// ===== Argument helpers =====

fn str_arg(args: &Value, name: &str) -> Result<String> {
    args.get(name)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| BridgeError::Validation(format!("missing string argument '{name}'")))
}

fn opt_str_arg(args: &Value, name: &str) -> Option<String> {
    args.get(name).and_then(Value::as_str).map(str::to_string)
}

fn i64_arg(args: &Value, name: &str) -> Result<i64> {
    args.get(name)
        .and_then(Value::as_i64)
        .ok_or_else(|| BridgeError::Validation(format!("missing integer argument '{name}'")))
}

fn opt_i64_arg(args: &Value, name: &str) -> Option<i64> {
    args.get(name).and_then(Value::as_i64)
}

fn object_arg(args: &Value, name: &str) -> Result<Value> {
    match args.get(name) {
        Some(v @ Value::Object(_)) => Ok(v.clone()),
        _ => Err(BridgeError::Validation(format!(
            "missing object argument '{name}'"
        ))),
    }
}

/// Cache label when the caller does not pick one.
const DEFAULT_IDENTIFIER: &str = "default";

// ===== Dispatch =====

pub async fn call_tool(ctx: &ToolContext, name: &str, args: &Value) -> Result<Value> {
    match name {
        "login" => {
            let handle = ctx
                .auth
                .authenticate_with_credentials(
                    &str_arg(args, "host")?,
                    &str_arg(args, "username")?,
                    &str_arg(args, "password")?,
                )
                .await?;
            Ok(json!({ "session_id": handle }))
        }
        "login_with_token" => {
            let kind = match opt_str_arg(args, "token_type") {
                Some(raw) => CredentialKind::parse(&raw).ok_or_else(|| {
                    BridgeError::Validation(format!("unknown token_type '{raw}'"))
                })?,
                None => CredentialKind::Bearer,
            };
            let handle = ctx
                .auth
                .authenticate_with_token(
                    &str_arg(args, "host")?,
                    &str_arg(args, "token")?,
                    kind,
                    opt_i64_arg(args, "user_id"),
                )
                .await?;
            Ok(json!({ "session_id": handle }))
        }
        "login_from_cache" => {
            let identifier =
                opt_str_arg(args, "identifier").unwrap_or_else(|| DEFAULT_IDENTIFIER.to_string());
            let handle = ctx
                .auth
                .authenticate_from_cache(&str_arg(args, "host")?, &identifier)
                .await?;
            Ok(json!({ "session_id": handle }))
        }
        "logout" => {
            let outcome = ctx.auth.logout(&str_arg(args, "session_id")?);
            Ok(json!({ "status": outcome }))
        }
        "session_status" => {
            let status = ctx.auth.status(&str_arg(args, "session_id")?);
            serde_json::to_value(status)
                .map_err(|e| BridgeError::InvalidResponse(e.to_string()))
        }
        "save_session_token" => {
            let identifier =
                opt_str_arg(args, "identifier").unwrap_or_else(|| DEFAULT_IDENTIFIER.to_string());
            let record = ctx
                .auth
                .save_token(&str_arg(args, "session_id")?, &identifier)
                .await?;
            Ok(json!({
                "status": "saved",
                "host": record.host,
                "identifier": record.identifier,
                "token_type": record.kind,
            }))
        }
        "delete_cached_token" => {
            let identifier =
                opt_str_arg(args, "identifier").unwrap_or_else(|| DEFAULT_IDENTIFIER.to_string());
            let deleted = ctx
                .auth
                .delete_token(&str_arg(args, "host")?, &identifier)
                .await?;
            Ok(json!({ "status": if deleted { "deleted" } else { "not_found" } }))
        }
        "list_cached_tokens" => {
            let tokens = ctx.auth.list_tokens()?;
            Ok(json!({ "count": tokens.len(), "tokens": tokens }))
        }
        "health_check" => {
            let report = ctx.auth.health_check(&str_arg(args, "session_id")?).await;
            serde_json::to_value(report)
                .map_err(|e| BridgeError::InvalidResponse(e.to_string()))
        }
        "get_server_metrics" => Ok(ctx.metrics.snapshot()),
        _ => call_resource_tool(ctx, name, args).await,
    }
}

/// CRUD passthrough tools. All of them share the same shape: check out
/// the session, then delegate to the API client.
///
/// A credential revoked remotely is not detected here: the session stays
/// registered and every use fails with the remote's rejection, until the
/// caller logs out or the expiry sweep removes it.
async fn call_resource_tool(ctx: &ToolContext, name: &str, args: &Value) -> Result<Value> {
    let session = ctx.auth.checkout(&str_arg(args, "session_id")?).await?;
    let api = ctx.auth.api();
    let host = &session.host;
    let credential = &session.credential;

    // (resource path, id argument name) per entity kind.
    let (resource, id_arg) = match name {
        "list_projects" | "get_project" | "create_project" | "update_project"
        | "delete_project" => ("projects", "project_id"),
        "list_user_stories" | "get_user_story" | "create_user_story" | "update_user_story"
        | "delete_user_story" => ("userstories", "user_story_id"),
        "list_tasks" | "get_task" | "create_task" | "update_task" | "delete_task" => {
            ("tasks", "task_id")
        }
        "list_issues" | "get_issue" | "create_issue" | "update_issue" | "delete_issue" => {
            ("issues", "issue_id")
        }
        "list_milestones" | "get_milestone" => ("milestones", "milestone_id"),
        "list_epics" | "get_epic" => ("epics", "epic_id"),
        "list_wiki_pages" | "get_wiki_page" => ("wiki", "page_id"),
        _ => {
            return Err(BridgeError::Validation(format!("unknown tool '{name}'")));
        }
    };

    if name == "list_projects" {
        // Membership filter needs a resolved subject id; without one the
        // unfiltered listing comes back (degraded application-token mode).
        return api.list_projects(host, credential, session.subject_id).await;
    }

    match name.split('_').next().unwrap_or(name) {
        "list" => {
            let query = vec![("project", i64_arg(args, "project_id")?.to_string())];
            api.list_resource(host, credential, resource, &query).await
        }
        "get" => {
            api.get_resource(host, credential, resource, i64_arg(args, id_arg)?)
                .await
        }
        "create" => {
            let mut data = object_arg(args, "data")?;
            if let (Some(map), Ok(project)) = (data.as_object_mut(), i64_arg(args, "project_id")) {
                map.insert("project".to_string(), json!(project));
            }
            api.create_resource(host, credential, resource, data).await
        }
        "update" => {
            api.update_resource(
                host,
                credential,
                resource,
                i64_arg(args, id_arg)?,
                i64_arg(args, "version")?,
                object_arg(args, "data")?,
            )
            .await
        }
        "delete" => {
            api.delete_resource(host, credential, resource, i64_arg(args, id_arg)?)
                .await?;
            Ok(json!({ "status": "deleted" }))
        }
        _ => Err(BridgeError::Validation(format!("unknown tool '{name}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiClient;
    use crate::auth::{SessionStore, Vault};
    use crate::config::Config;
    use crate::limiter::TokenBucket;
    use tempfile::TempDir;

    fn ctx() -> (TempDir, ToolContext) {
        let dir = TempDir::new().expect("tempdir");
        let config = Config::default();
        let store = Arc::new(SessionStore::new(TokenBucket::new(
            config.rate_limit_capacity,
        )));
        let vault = Arc::new(Vault::new(dir.path().join("tokens")));
        let api = ApiClient::new(&config).expect("client");
        let auth = Arc::new(Authenticator::new(api, store, vault, &config));
        let metrics = Arc::new(MetricsRecorder::new());
        (dir, ToolContext { auth, metrics })
    }

    #[test]
    fn every_tool_has_an_object_schema() {
        for tool in tool_definitions() {
            assert_eq!(
                tool.schema.get("type").and_then(Value::as_str),
                Some("object"),
                "tool {} schema",
                tool.name
            );
            assert!(!tool.description.is_empty());
        }
    }

    #[test]
    fn tool_names_are_unique() {
        let defs = tool_definitions();
        let mut names: Vec<_> = defs.iter().map(|t| t.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), defs.len());
    }

    #[tokio::test]
    async fn unknown_tool_is_a_validation_error() {
        let (_dir, ctx) = ctx();
        let result = call_tool(&ctx, "frobnicate", &json!({"session_id": "x"})).await;
        assert!(matches!(result, Err(BridgeError::Validation(_))));
    }

    #[tokio::test]
    async fn missing_arguments_are_validation_errors() {
        let (_dir, ctx) = ctx();
        let result = call_tool(&ctx, "login", &json!({"host": "https://t.example"})).await;
        assert!(matches!(result, Err(BridgeError::Validation(_))));
    }

    #[tokio::test]
    async fn crud_tools_require_a_live_session() {
        let (_dir, ctx) = ctx();
        let result = call_tool(
            &ctx,
            "list_projects",
            &json!({"session_id": "not-a-session"}),
        )
        .await;
        assert!(matches!(result, Err(BridgeError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn logout_tool_reports_both_outcomes() {
        let (_dir, ctx) = ctx();
        let result = call_tool(&ctx, "logout", &json!({"session_id": "gone"}))
            .await
            .unwrap();
        assert_eq!(result["status"], "already_gone");
    }

    #[tokio::test]
    async fn health_check_reports_missing_session_without_failing() {
        let (_dir, ctx) = ctx();
        let report = call_tool(&ctx, "health_check", &json!({"session_id": "gone"}))
            .await
            .unwrap();
        assert_eq!(report["status"], "unhealthy");
        assert_eq!(report["session_active"], false);
        assert_eq!(report["api_accessible"], false);
    }

    #[tokio::test]
    async fn metrics_tool_reflects_recorded_calls() {
        let (_dir, ctx) = ctx();
        ctx.metrics
            .record("session_status", std::time::Duration::from_millis(2), true);
        ctx.metrics
            .record("session_status", std::time::Duration::from_millis(4), false);

        let snap = call_tool(&ctx, "get_server_metrics", &json!({})).await.unwrap();
        assert_eq!(snap["total_requests"], 2);
        assert_eq!(snap["total_errors"], 1);
        assert_eq!(snap["tools"]["session_status"]["request_count"], 2);
    }

    #[tokio::test]
    async fn cached_token_tools_roundtrip() {
        let (_dir, ctx) = ctx();

        let result = call_tool(&ctx, "list_cached_tokens", &json!({})).await.unwrap();
        assert_eq!(result["count"], 0);

        let result = call_tool(
            &ctx,
            "delete_cached_token",
            &json!({"host": "https://t.example"}),
        )
        .await
        .unwrap();
        assert_eq!(result["status"], "not_found");
    }
}
