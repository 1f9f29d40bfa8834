//! The builder registry (C5).
//!
//! A builder is represented as data plus two capability functions, not a
//! trait object hierarchy: [`BuilderDescriptor`] pairs a
//! [`kiln_protocol::BuilderRegistration`] with `plan_jobs`/`run_job`
//! closures, each boxed the same `Box<dyn Fn(...) -> BoxFuture<...> + Send +
//! Sync>` shape the teacher's cache-restore pipeline uses for its
//! generically-typed write callback. Loading a builder's executable module
//! is out of scope (§1 Non-goals) — this registry only holds whatever
//! capability functions the caller already resolved into memory.

use std::{collections::HashMap, sync::Arc};

use color_eyre::{Result, eyre::bail};
use futures::future::BoxFuture;
use kiln_protocol::{BuilderId, BuilderRegistration, JobDescriptor, PlanJobsOutcome, PlatformId, RunJobOutcome};
use tracing::warn;

use crate::{
    path::{AbsDirPath, AbsFilePath, RelFilePath},
    pattern::CompiledPattern,
};

pub type PlanJobsFn = Arc<dyn Fn(PlanJobsRequest) -> BoxFuture<'static, PlanJobsOutcome> + Send + Sync>;
pub type RunJobFn = Arc<dyn Fn(RunJobRequest) -> BoxFuture<'static, RunJobOutcome> + Send + Sync>;

/// What a builder's `plan_jobs` capability is called with.
#[derive(Clone, Debug)]
pub struct PlanJobsRequest {
    pub relpath: RelFilePath,
    pub abs_path: AbsFilePath,
    pub platforms: Vec<PlatformId>,
}

/// What a builder's `run_job` capability is called with.
#[derive(Clone, Debug)]
pub struct RunJobRequest {
    pub relpath: RelFilePath,
    pub abs_path: AbsFilePath,
    pub job: JobDescriptor,
    pub output_dir: AbsDirPath,
}

/// A registered builder: its static registration record, compiled match
/// patterns, and its two capability functions.
#[derive(Clone)]
pub struct BuilderDescriptor {
    pub registration: BuilderRegistration,
    patterns: Vec<CompiledPattern>,
    pub plan_jobs: PlanJobsFn,
    pub run_job: RunJobFn,
}

impl BuilderDescriptor {
    pub fn matches(&self, relpath: &str) -> bool {
        self.patterns.iter().any(|pattern| pattern.is_match(relpath))
    }
}

impl std::fmt::Debug for BuilderDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuilderDescriptor")
            .field("registration", &self.registration)
            .finish_non_exhaustive()
    }
}

/// The fixed table of builders a running daemon consults to plan and run
/// jobs, built once at startup.
#[derive(Clone, Debug, Default)]
pub struct BuilderRegistry {
    by_id: HashMap<BuilderId, BuilderDescriptor>,
}

impl BuilderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one builder.
    ///
    /// Rejects the registration outright if its id collides with one
    /// already registered (§4.5 "builder ids are assumed unique"). A name
    /// collision, or a pattern that fails to compile, is logged and the
    /// whole registration is dropped rather than failing startup for every
    /// other builder — one misconfigured builder module shouldn't take the
    /// daemon down.
    pub fn register(&mut self, registration: BuilderRegistration, plan_jobs: PlanJobsFn, run_job: RunJobFn) -> Result<()> {
        if self.by_id.contains_key(&registration.id) {
            bail!("duplicate builder id {}", registration.id);
        }
        if self.by_id.values().any(|b| b.registration.name == registration.name) {
            warn!(name = %registration.name, "duplicate builder name, ignoring registration");
            return Ok(());
        }

        let mut patterns = Vec::with_capacity(registration.patterns.len());
        for (pattern, kind) in &registration.patterns {
            match CompiledPattern::compile(pattern, *kind) {
                Ok(compiled) => patterns.push(compiled),
                Err(err) => {
                    warn!(name = %registration.name, pattern, ?err, "builder pattern failed to compile, skipping registration");
                    return Ok(());
                }
            }
        }

        let id = registration.id;
        self.by_id.insert(
            id,
            BuilderDescriptor {
                registration,
                patterns,
                plan_jobs,
                run_job,
            },
        );
        Ok(())
    }

    pub fn get(&self, id: &BuilderId) -> Option<&BuilderDescriptor> {
        self.by_id.get(id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Every registered builder whose patterns match `relpath`, ordered by
    /// descending priority (ties broken by registration order, i.e. stable).
    pub fn matching(&self, relpath: &RelFilePath) -> Vec<&BuilderDescriptor> {
        let relpath = relpath.as_str_lossy();
        let mut matched: Vec<&BuilderDescriptor> = self.by_id.values().filter(|b| b.matches(&relpath)).collect();
        matched.sort_by(|a, b| b.registration.priority.cmp(&a.registration.priority));
        matched
    }

    pub fn iter(&self) -> impl Iterator<Item = &BuilderDescriptor> {
        self.by_id.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_protocol::PatternKind;
    use pretty_assertions::assert_eq;

    fn registration(name: &str, pattern: &str, priority: i32) -> BuilderRegistration {
        BuilderRegistration {
            id: BuilderId::new(),
            name: name.to_string(),
            patterns: vec![(pattern.to_string(), PatternKind::Glob)],
            version: "1".to_string(),
            priority,
            critical: false,
            test_for_exclusive_lock: false,
        }
    }

    fn noop_plan() -> PlanJobsFn {
        Arc::new(|_| Box::pin(async { PlanJobsOutcome::Success(vec![]) }))
    }

    fn noop_run() -> RunJobFn {
        Arc::new(|_| Box::pin(async { RunJobOutcome::Success(vec![]) }))
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let mut registry = BuilderRegistry::new();
        let reg = registration("a", "*.txt", 0);
        registry.register(reg.clone(), noop_plan(), noop_run()).unwrap();
        let result = registry.register(reg, noop_plan(), noop_run());
        assert!(result.is_err());
    }

    #[test]
    fn duplicate_name_is_dropped_not_rejected() {
        let mut registry = BuilderRegistry::new();
        registry.register(registration("dup", "*.txt", 0), noop_plan(), noop_run()).unwrap();
        registry.register(registration("dup", "*.png", 0), noop_plan(), noop_run()).unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn invalid_pattern_is_skipped() {
        let mut registry = BuilderRegistry::new();
        let mut reg = registration("bad", "*.txt", 0);
        reg.patterns = vec![("[".to_string(), PatternKind::Regex)];
        registry.register(reg, noop_plan(), noop_run()).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn matching_orders_by_descending_priority() {
        let mut registry = BuilderRegistry::new();
        registry.register(registration("low", "*.txt", 1), noop_plan(), noop_run()).unwrap();
        registry.register(registration("high", "*.txt", 10), noop_plan(), noop_run()).unwrap();

        let relpath = RelFilePath::try_from("foo.txt").unwrap();
        let matched = registry.matching(&relpath);
        assert_eq!(matched.len(), 2);
        assert_eq!(matched[0].registration.name, "high");
        assert_eq!(matched[1].registration.name, "low");
    }
}
