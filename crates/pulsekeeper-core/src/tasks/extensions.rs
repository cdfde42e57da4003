//! Marketplace tags for new and trending extensions

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use tracing::{error, info};

use crate::db::ExtensionStore;
use crate::error::{Error, Result};
use crate::models::{Extension, TAG_NEW, TAG_TRENDING};

/// Recent extensions whose installs grew by more than this factor are trending
const TRENDING_GROWTH: u64 = 2;

/// Share of the average installs a trending extension must exceed
const TRENDING_AVERAGE_SHARE: f64 = 0.9;

pub struct ExtensionTagger {
    extensions: Arc<dyn ExtensionStore>,
    new_period: std::time::Duration,
}

impl ExtensionTagger {
    pub fn new(extensions: Arc<dyn ExtensionStore>, new_period: std::time::Duration) -> Self {
        Self {
            extensions,
            new_period,
        }
    }

    /// Tag recent extensions as new and untag older ones
    pub async fn tag_new_extensions(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - self.period()?;

        let mut changed: Vec<Extension> = self
            .extensions
            .created_after(cutoff)
            .await?
            .into_iter()
            .filter_map(|mut ext| ext.add_tag(TAG_NEW).then_some(ext))
            .collect();

        changed.extend(
            self.extensions
                .tagged_created_before(TAG_NEW, cutoff)
                .await?
                .into_iter()
                .filter_map(|mut ext| ext.remove_tag(TAG_NEW).then_some(ext)),
        );

        let saved = self.save_all(&changed).await;
        info!(saved, "Updated new extension tags");
        Ok(saved)
    }

    /// Tag recent extensions whose installs are growing fast
    pub async fn tag_trending_extensions(&self, now: DateTime<Utc>) -> Result<usize> {
        let before = now - self.period()?;
        let recent = self.extensions.created_after(before).await?;
        if recent.is_empty() {
            return Ok(0);
        }

        let mut installs = Vec::with_capacity(recent.len());
        for ext in &recent {
            let current = self.extensions.install_count(ext.id, None).await?;
            let earlier = self.extensions.install_count(ext.id, Some(before)).await?;
            installs.push((current, earlier));
        }

        let average = average_installs(installs.iter().map(|(current, _)| *current));

        let changed: Vec<Extension> = recent
            .into_iter()
            .zip(installs)
            .filter_map(|(mut ext, (current, earlier))| {
                let updated = if is_trending(current, earlier, average) {
                    ext.add_tag(TAG_TRENDING)
                } else {
                    ext.remove_tag(TAG_TRENDING)
                };
                updated.then_some(ext)
            })
            .collect();

        let saved = self.save_all(&changed).await;
        info!(saved, "Updated trending extension tags");
        Ok(saved)
    }

    fn period(&self) -> Result<Duration> {
        Duration::from_std(self.new_period)
            .map_err(|e| Error::config(format!("new extension period: {e}")))
    }

    async fn save_all(&self, changed: &[Extension]) -> usize {
        join_all(changed.iter().map(|ext| async move {
            let result = self.extensions.save_tags(ext.id, &ext.tags).await;
            if let Err(e) = &result {
                error!(extension_id = %ext.id, error = %e, "Failed to save extension tags");
            }
            result.is_ok()
        }))
        .await
        .into_iter()
        .filter(|saved| *saved)
        .count()
    }
}

/// Mean installs across extensions; zero when there are none
pub fn average_installs(installs: impl Iterator<Item = u64>) -> f64 {
    let (total, count) = installs.fold((0u64, 0u64), |(total, count), n| (total + n, count + 1));
    if count == 0 {
        0.0
    } else {
        total as f64 / count as f64
    }
}

/// Installs more than doubled and sit above most of the recent average
pub fn is_trending(current: u64, earlier: u64, average: f64) -> bool {
    current > earlier * TRENDING_GROWTH && current as f64 > TRENDING_AVERAGE_SHARE * average
}
