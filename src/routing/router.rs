use super::availability::AvailabilityCache;
use super::broadcast::race;
use super::link::ClusterLink;
use super::sticky::StickyCache;
use crate::config::RoutingConfig;
use crate::error::Result;
use crate::fabric::protocol::{Question, UnitQuery};
use crate::ids::unit_hash;

use rand::Rng;

/// Resolves `(session, stage, key?)` to the key of the node that should
/// receive the unit.
pub struct Router {
    sticky: StickyCache,
    availability: AvailabilityCache,
}

impl Router {
    pub fn new(config: RoutingConfig) -> Self {
        Self {
            sticky: StickyCache::new(),
            availability: AvailabilityCache::new(config),
        }
    }

    pub async fn resolve(
        &self,
        link: &dyn ClusterLink,
        session: &str,
        stage: &str,
        key: Option<&str>,
    ) -> Result<String> {
        match key {
            Some(key) => {
                let unit = unit_hash(session, stage, Some(key));
                self.sticky
                    .get_or_resolve(&unit, || self.locate_owner(link, session, stage, key))
                    .await
            }
            None => self.pick_capable(link, stage).await,
        }
    }

    /// Known sticky binding for a triple, without resolving it.
    pub fn binding(&self, session: &str, stage: &str, key: Option<&str>) -> Option<String> {
        self.sticky.peek(&unit_hash(session, stage, key))
    }

    pub fn sticky(&self) -> &StickyCache {
        &self.sticky
    }

    pub fn availability(&self) -> &AvailabilityCache {
        &self.availability
    }

    async fn locate_owner(
        &self,
        link: &dyn ClusterLink,
        session: &str,
        stage: &str,
        key: &str,
    ) -> Result<String> {
        let query = serde_json::to_value(UnitQuery {
            session: session.to_string(),
            stage: stage.to_string(),
            key: Some(key.to_string()),
        })?;

        if let Some((peer, answer)) = race(link, Question::GetSessionStageKeyServer, query).await
            && let Some(owner) = answer.as_str()
        {
            tracing::debug!("Unit {}/{} already owned by {} (via {})", stage, key, owner, peer);
            return Ok(owner.to_string());
        }

        let chosen = self.pick_capable(link, stage).await?;
        tracing::debug!("Unit {}/{} assigned to {}", stage, key, chosen);
        Ok(chosen)
    }

    async fn pick_capable(&self, link: &dyn ClusterLink, stage: &str) -> Result<String> {
        let keys = self.availability.capable(link, stage).await?;
        let index = rand::thread_rng().gen_range(0..keys.len());
        Ok(keys[index].clone())
    }
}
