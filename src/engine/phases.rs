//! The 14 phase handlers and the startup registry builder.
//!
//! Phases 1-4 consume prior conversation and artifacts; phases 5-14 are
//! stateless report generators and share one handler shape. All content is
//! template-driven — the real generation backend is an external collaborator
//! and out of scope here.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};

use crate::errors::EngineError;

use super::context::{ExecutionContext, Outcome, OutcomeStatus};
use super::handler::PhaseHandler;
use super::registry::HandlerRegistry;
use super::templates;

/// Build the full production registry. Called exactly once at startup; any
/// error here is fatal before the process serves traffic.
pub fn build_registry() -> Result<HandlerRegistry, EngineError> {
    let mut registry = HandlerRegistry::new();

    registry.register("phase1", Arc::new(RequirementsHandler))?;
    registry.register("phase2", Arc::new(CodeGenHandler))?;
    registry.register("phase3", Arc::new(DeployScriptHandler))?;
    registry.register("phase4", Arc::new(SelfImprovementHandler))?;
    registry.register("phase5", Arc::new(TestGenHandler))?;

    for report in REPORTS {
        registry.register(report.name, Arc::new(report))?;
    }

    Ok(registry)
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    let lower = haystack.to_lowercase();
    needles.iter().any(|n| lower.contains(n))
}

// ── Phase 1: requirements gathering ──────────────────────────────────

pub struct RequirementsHandler;

#[async_trait]
impl PhaseHandler for RequirementsHandler {
    fn name(&self) -> &'static str {
        "phase1"
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<Outcome, EngineError> {
        let is_ecommerce = contains_any(
            &ctx.user_text,
            &["shop", "store", "ecommerce", "e-commerce", "cart", "marketplace"],
        );

        let mut text = if is_ecommerce {
            format!(
                "An e-commerce build for {} — a few things to pin down first:\n\n\
                 1. **Catalog**: physical goods, digital goods, or both?\n\
                 2. **Payments**: which provider (Stripe, PayPal, ...)?\n\
                 3. **Accounts**: do customers need to register?\n\
                 4. **Inventory**: is real-time stock tracking required?\n\
                 5. **Fulfilment**: any carrier integration?\n\n\
                 Start with the must-have features and we will work outward.",
                ctx.project_name
            )
        } else {
            format!(
                "Let's scope \"{}\" for {}:\n\n\
                 1. **Goal**: what should this application accomplish?\n\
                 2. **Users**: who uses it (end users, admins, both)?\n\
                 3. **Core features**: what is indispensable?\n\
                 4. **Data**: what does it store and query?\n\n\
                 The more concrete the answers, the sharper the proposal.",
                ctx.user_text.trim(),
                ctx.project_name
            )
        };

        if !ctx.prior_messages.is_empty() {
            text.push_str(&format!(
                "\n\n_(Resuming with {} earlier turns of context.)_",
                ctx.prior_messages.len()
            ));
        }

        Ok(Outcome::success(text))
    }
}

// ── Phase 2: code generation ─────────────────────────────────────────

pub struct CodeGenHandler;

#[async_trait]
impl PhaseHandler for CodeGenHandler {
    fn name(&self) -> &'static str {
        "phase2"
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<Outcome, EngineError> {
        let files = templates::scaffold_files(&ctx.project_name);

        let mut text = format!("Generated the scaffold for {}.\n", ctx.project_name);
        for (collection, entries) in &files {
            text.push_str(&format!("\n**{}**\n", collection));
            for path in entries.keys() {
                text.push_str(&format!("- `{}`\n", path));
            }
        }
        if ctx.prior_file_count() > 0 {
            text.push_str(&format!(
                "\nExisting files ({}) at the same paths will be updated in place.\n",
                ctx.prior_file_count()
            ));
        }
        text.push_str("\nOpen the file browser to review and edit before moving on.");

        Ok(Outcome::success(text).with_artifacts(files))
    }
}

// ── Phase 3: deployment-script generation ────────────────────────────

pub struct DeployScriptHandler;

#[async_trait]
impl PhaseHandler for DeployScriptHandler {
    fn name(&self) -> &'static str {
        "phase3"
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<Outcome, EngineError> {
        let files = templates::deploy_files(&ctx.project_name);
        let safe = templates::slug(&ctx.project_name);

        // Short stable-looking id for the simulated rollout narrative.
        let digest = Sha256::digest(
            format!("{}{}{}", ctx.project_id, ctx.project_name, Utc::now().timestamp_nanos_opt().unwrap_or_default()).as_bytes(),
        );
        let deploy_id: String = digest.iter().take(4).map(|b| format!("{:02x}", b)).collect();

        let text = format!(
            "Deployment scripts generated for {project}. This is a dry run — \
             nothing was pushed or deployed.\n\n\
             **Files**\n\
             - `deploy/Dockerfile`\n\
             - `deploy/deploy.sh`\n\
             - `deploy/vercel.json`\n\n\
             **Simulated rollout ({deploy_id})**\n\
             1. push to repository\n\
             2. frontend -> https://{safe}-{deploy_id}.vercel.app\n\
             3. backend  -> https://{safe}-backend-{deploy_id}.run.app\n\n\
             Run `deploy/deploy.sh` yourself when you are ready.",
            project = ctx.project_name,
        );

        Ok(Outcome::success(text)
            .with_status(OutcomeStatus::Simulated)
            .with_artifacts(files))
    }
}

// ── Phase 4: self-improvement proposal ───────────────────────────────

pub struct SelfImprovementHandler;

#[async_trait]
impl PhaseHandler for SelfImprovementHandler {
    fn name(&self) -> &'static str {
        "phase4"
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<Outcome, EngineError> {
        let kind = if contains_any(&ctx.user_text, &["slow", "performance", "latency", "speed"]) {
            "performance"
        } else if contains_any(&ctx.user_text, &["bug", "error", "crash", "fix"]) {
            "bug_fix"
        } else if contains_any(&ctx.user_text, &["feature", "add", "new"]) {
            "feature"
        } else {
            "general"
        };

        let outcome = match kind {
            "performance" => Outcome::success(
                "Performance improvement proposal:\n\n\
                 1. Lazy-load heavy frontend routes and trim the bundle.\n\
                 2. Cache hot queries and remove N+1 access patterns.\n\
                 3. Re-run the load profile after each change.\n\n\
                 Estimated effort: 4 days. Approve to queue the work.",
            )
            .with_status(OutcomeStatus::PendingApproval),
            "bug_fix" => Outcome::success(
                "Bug-fix proposal:\n\n\
                 - **high**: token handling fails on re-login\n\
                 - **medium**: phase transition leaks a subscription\n\
                 - **low**: file tree collapses on refresh\n\n\
                 Estimated effort: 2 days. Approve to queue the fixes.",
            )
            .with_status(OutcomeStatus::PendingApproval),
            "feature" => Outcome::success(
                "Feature proposal:\n\n\
                 1. **Collaboration** — shared project sessions (7 days)\n\
                 2. **Notifications** — push updates on phase completion (3 days)\n\n\
                 Recommend starting with collaboration. Approve to queue it.",
            )
            .with_status(OutcomeStatus::PendingApproval),
            _ => Outcome::success(
                "What should be improved? Candidate areas:\n\n\
                 1. performance\n2. new features\n3. bug fixes\n4. security\n5. UX\n\n\
                 Name one (e.g. \"the editor feels slow\") and a concrete \
                 proposal comes back for approval.",
            ),
        };

        Ok(outcome)
    }
}

// ── Phase 5: test generation ─────────────────────────────────────────

pub struct TestGenHandler;

#[async_trait]
impl PhaseHandler for TestGenHandler {
    fn name(&self) -> &'static str {
        "phase5"
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<Outcome, EngineError> {
        let files = templates::test_files(&ctx.project_name);
        let count: usize = files.values().map(|c| c.len()).sum();

        let text = format!(
            "Generated {count} test files for {}.\n\n\
             **Frontend** (Vitest)\n\
             - `frontend/vitest.config.ts`\n\
             - `frontend/src/test/App.test.tsx`\n\n\
             **Backend** (pytest)\n\
             - `backend/tests/conftest.py`\n\
             - `backend/tests/test_health.py`\n\n\
             Run `npm run test` and `pytest` to execute them.",
            ctx.project_name
        );

        Ok(Outcome::success(text).with_artifacts(files))
    }
}

// ── Phases 6-14: report generators ───────────────────────────────────

/// A stateless report phase: fixed title, fixed body template with a
/// `{project}` placeholder. No artifacts, no use of prior context.
#[derive(Clone, Copy)]
pub struct ReportHandler {
    name: &'static str,
    title: &'static str,
    body: &'static str,
}

#[async_trait]
impl PhaseHandler for ReportHandler {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<Outcome, EngineError> {
        let text = format!(
            "## {} — {}\n\n{}",
            self.title,
            ctx.project_name,
            self.body.replace("{project}", &ctx.project_name)
        );
        Ok(Outcome::success(text))
    }
}

const REPORTS: [ReportHandler; 9] = [
    ReportHandler {
        name: "phase6",
        title: "Documentation",
        body: "Proposed documentation set for {project}:\n\n\
               - `README.md` — setup, development, deployment\n\
               - `docs/architecture.md` — component map and data flow\n\
               - `docs/api.md` — endpoint reference with examples\n\n\
               Each document is generated from the current code and kept in the project file store.",
    },
    ReportHandler {
        name: "phase7",
        title: "Debug report",
        body: "Static review of {project} found:\n\n\
               1. **high** — unhandled rejection path in the API client\n\
               2. **medium** — effect cleanup missing on route change\n\
               3. **low** — console noise in production builds\n\n\
               Suggested order: fix high first, re-run the suite between fixes.",
    },
    ReportHandler {
        name: "phase8",
        title: "Performance report",
        body: "Baseline numbers for {project}:\n\n\
               - first load: ~2.1s (target < 1.5s)\n\
               - API p50: ~180ms, p95: ~420ms\n\n\
               Biggest wins: route-level code splitting, query result caching, \
               and compressing static assets.",
    },
    ReportHandler {
        name: "phase9",
        title: "Security audit",
        body: "Checklist applied to {project}:\n\n\
               - [x] parameterized queries only\n\
               - [x] secrets kept out of the repository\n\
               - [ ] rate limiting on auth endpoints\n\
               - [ ] dependency audit in CI\n\n\
               Unchecked items are the recommended next steps, highest risk first.",
    },
    ReportHandler {
        name: "phase10",
        title: "Database design",
        body: "Proposed schema for {project}:\n\n\
               - `users(id, email, created_at)`\n\
               - `items(id, owner_id -> users, name, created_at)`\n\n\
               Indexes on every foreign key and on `items(owner_id, created_at)` \
               for the listing query. Migrations stay additive.",
    },
    ReportHandler {
        name: "phase11",
        title: "API design",
        body: "Resource-oriented surface for {project}:\n\n\
               - `GET/POST /api/items`, `GET/PATCH/DELETE /api/items/:id`\n\
               - errors as `{\"error\": message}` with conventional status codes\n\
               - cursor pagination on every list endpoint\n\n\
               Versioning deferred until a breaking change is actually needed.",
    },
    ReportHandler {
        name: "phase12",
        title: "UX review",
        body: "Walkthrough notes for {project}:\n\n\
               1. empty states need a call to action\n\
               2. destructive actions need confirmation\n\
               3. loading states flash on fast connections — add a delay threshold\n\n\
               None of these block launch; all three are quick wins.",
    },
    ReportHandler {
        name: "phase13",
        title: "Refactor plan",
        body: "Ordered plan for {project}:\n\n\
               1. extract the API client into a typed module\n\
               2. collapse duplicated form state handling\n\
               3. move inline styles into the theme\n\n\
               Each step is independently shippable; stop at any point.",
    },
    ReportHandler {
        name: "phase14",
        title: "Monitoring setup",
        body: "Minimal viable monitoring for {project}:\n\n\
               - structured request logs with latency and status\n\
               - uptime probe on `/health` every 60s\n\
               - error-rate alert at 5% over 5 minutes\n\n\
               Dashboards come after the first week of real traffic.",
    },
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::context::ArtifactMap;

    fn ctx(text: &str) -> ExecutionContext {
        ExecutionContext::new("p1", "Demo Shop", text)
    }

    #[tokio::test]
    async fn registry_holds_all_fourteen_phases() {
        let registry = build_registry().unwrap();
        assert_eq!(registry.len(), 14);
        for n in 1..=14 {
            assert!(registry.names().contains(&format!("phase{n}")));
        }
    }

    #[tokio::test]
    async fn requirements_detects_ecommerce() {
        let out = RequirementsHandler
            .execute(&ctx("build an ecommerce site"))
            .await
            .unwrap();
        assert_eq!(out.status, OutcomeStatus::Success);
        assert!(out.text.contains("Payments"));
        assert!(!out.has_artifacts());
    }

    #[tokio::test]
    async fn requirements_mentions_prior_turns() {
        let mut context = ctx("a todo app");
        context.prior_messages.push(super::super::context::ConversationTurn {
            role: "user".into(),
            content: "earlier".into(),
        });
        let out = RequirementsHandler.execute(&context).await.unwrap();
        assert!(out.text.contains("1 earlier turns"));
    }

    #[tokio::test]
    async fn codegen_emits_frontend_and_backend_artifacts() {
        let out = CodeGenHandler.execute(&ctx("scaffold it")).await.unwrap();
        assert!(out.artifacts["frontend"].contains_key("src/App.tsx"));
        assert!(out.artifacts["backend"].contains_key("main.py"));
        assert!(out.text.contains("src/App.tsx"));
    }

    #[tokio::test]
    async fn deploy_is_simulated_and_script_only() {
        let out = DeployScriptHandler.execute(&ctx("ship it")).await.unwrap();
        assert_eq!(out.status, OutcomeStatus::Simulated);
        assert!(out.artifacts["deploy"].contains_key("deploy.sh"));
        assert!(out.text.contains("dry run"));
    }

    #[tokio::test]
    async fn self_improvement_classifies_and_awaits_approval() {
        let out = SelfImprovementHandler
            .execute(&ctx("the dashboard is slow"))
            .await
            .unwrap();
        assert_eq!(out.status, OutcomeStatus::PendingApproval);

        let out = SelfImprovementHandler.execute(&ctx("hello")).await.unwrap();
        assert_eq!(out.status, OutcomeStatus::Success);
    }

    #[tokio::test]
    async fn reports_are_pure_text() {
        for report in REPORTS {
            let out = report.execute(&ctx("anything")).await.unwrap();
            assert_eq!(out.status, OutcomeStatus::Success);
            assert!(out.text.contains("Demo Shop"));
            assert_eq!(out.artifacts, ArtifactMap::new());
        }
    }
}
