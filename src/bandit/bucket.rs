//! Context bucketing for per-context beliefs.

use crate::config::BucketingConfig;
use crate::domain::Context;

/// Key under which arm beliefs are kept when bucketing is disabled.
pub const GLOBAL_BUCKET: &str = "all";

/// Discretizes a context into a bucket key. Beliefs are kept per (bucket, arm).
pub trait ContextBucketer: Send + Sync {
    fn bucket(&self, context: &Context) -> String;
}

/// Bucketer built from `BucketingConfig`: regime, session and trend-score bands.
#[derive(Debug, Clone, Default)]
pub struct ConfiguredBucketer {
    config: BucketingConfig,
}

impl ConfiguredBucketer {
    pub fn new(config: BucketingConfig) -> Self {
        Self { config }
    }

    fn trend_band(&self, trend_score: f64) -> usize {
        self.config
            .trend_cuts
            .iter()
            .take_while(|cut| trend_score >= **cut)
            .count()
    }
}

impl ContextBucketer for ConfiguredBucketer {
    fn bucket(&self, context: &Context) -> String {
        if !self.config.enabled {
            return GLOBAL_BUCKET.to_string();
        }
        let mut parts = Vec::with_capacity(3);
        if self.config.by_regime {
            parts.push(context.regime.as_str().to_string());
        }
        if self.config.by_session {
            parts.push(format!("s{}", context.session_code));
        }
        if !self.config.trend_cuts.is_empty() {
            parts.push(format!("t{}", self.trend_band(context.trend_score)));
        }
        if parts.is_empty() {
            GLOBAL_BUCKET.to_string()
        } else {
            parts.join("|")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::context::fixtures::quiet_context;
    use crate::domain::Regime;

    #[test]
    fn test_disabled_uses_global_bucket() {
        let b = ConfiguredBucketer::new(BucketingConfig::default());
        assert_eq!(b.bucket(&quiet_context()), GLOBAL_BUCKET);
    }

    #[test]
    fn test_bucket_key_parts() {
        let b = ConfiguredBucketer::new(BucketingConfig {
            enabled: true,
            by_regime: true,
            by_session: true,
            trend_cuts: vec![-0.5, 0.5],
        });
        let mut ctx = quiet_context();
        assert_eq!(b.bucket(&ctx), "trending|s1|t1");

        ctx.regime = Regime::Ranging;
        ctx.trend_score = 0.9;
        assert_eq!(b.bucket(&ctx), "ranging|s1|t2");

        ctx.trend_score = -2.0;
        assert_eq!(b.bucket(&ctx), "ranging|s1|t0");
    }
}
