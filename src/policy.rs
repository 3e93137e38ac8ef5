//! Migration policy interface and the default heuristic.
//!
//! The policy is the swappable "brain": anything that can look at a page's
//! statistics and propose a migration. The default heuristic promotes hot
//! slow-tier pages and demotes cold fast-tier pages; a learned model plugs
//! in by implementing [`MigrationPolicy`] and installing itself through the
//! manager.

use std::sync::Arc;

use crate::constants::*;
use crate::stats::PageStats;
use crate::tier::TierKind;
use crate::util::now_ns;

/// A proposed page migration. Ephemeral: produced by the policy, consumed
/// by the migration executor, never stored.
#[derive(Clone, Debug)]
pub struct MigrationDecision {
    pub page_addr: u64,
    pub from_tier: TierKind,
    pub to_tier: TierKind,
    /// Policy confidence in [0, 1]. Decisions below `CONFIDENCE_MIN` are
    /// not acted on.
    pub confidence: f64,
    pub reason: &'static str,
}

impl Default for MigrationDecision {
    fn default() -> Self {
        MigrationDecision {
            page_addr: 0,
            from_tier: TierKind::Unknown,
            to_tier: TierKind::Unknown,
            confidence: 0.0,
            reason: "",
        }
    }
}

/// The pluggable decision function.
///
/// `evaluate` receives a read-only statistics entry and a zeroed decision.
/// Returning true commits the policy to having filled every decision field,
/// with `page_addr` and `from_tier` taken from the entry itself.
pub trait MigrationPolicy: Send + Sync {
    fn evaluate(&self, stats: &PageStats, decision: &mut MigrationDecision) -> bool;

    /// Short label for logging.
    fn name(&self) -> &'static str {
        "custom"
    }
}

/// Heat-threshold heuristic with thrash protection.
///
/// Hot pages (heat above `HOT_THRESHOLD`) in the slow tier are promoted;
/// cold pages (heat below `COLD_THRESHOLD`) in the fast tier are demoted;
/// pages migrated less than `MIN_RESIDENCE_NS` ago are left alone.
pub struct DefaultPolicy;

impl MigrationPolicy for DefaultPolicy {
    fn evaluate(&self, stats: &PageStats, decision: &mut MigrationDecision) -> bool {
        let now = now_ns();

        let last_migration = stats
            .last_migration_ns
            .load(std::sync::atomic::Ordering::Relaxed);
        if last_migration > 0 && now.saturating_sub(last_migration) < MIN_RESIDENCE_NS {
            return false;
        }

        decision.page_addr = stats.page_addr();
        decision.from_tier = stats.current_tier();

        let heat = stats.heat_score();
        if stats.current_tier() == TierKind::Slow && heat > HOT_THRESHOLD {
            decision.to_tier = TierKind::Fast;
            decision.confidence = heat;
            decision.reason = "hot page promotion";
            return true;
        }

        if stats.current_tier() == TierKind::Fast && heat < COLD_THRESHOLD {
            decision.to_tier = TierKind::Slow;
            // Colder pages demote with higher confidence.
            decision.confidence = 1.0 - heat;
            decision.reason = "cold page demotion";
            return true;
        }

        false
    }

    fn name(&self) -> &'static str {
        "default heuristic"
    }
}

lazy_static! {
    /// Shared instance installed at startup and whenever a custom policy is
    /// removed.
    pub static ref DEFAULT_POLICY: Arc<dyn MigrationPolicy> = Arc::new(DefaultPolicy);
}
