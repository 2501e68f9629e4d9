//! Image pull progress aggregation

use crate::deploy::engine::{ContainerEngine, PullEvent};
use crate::errors::StoreError;

/// Per-image pull percentages reduced to one phase percentage
#[derive(Debug, Clone)]
pub struct PullProgress {
    percents: Vec<f64>,
}

impl PullProgress {
    /// Track `image_count` images, all starting at 0
    pub fn new(image_count: usize) -> Self {
        Self {
            percents: vec![0.0; image_count],
        }
    }

    /// Fold one event into the image at `index` and return the phase percent.
    ///
    /// Layer events arrive out of order, so a numeric percent never lowers
    /// the image's value.
    pub fn update(&mut self, index: usize, event: &PullEvent) -> f64 {
        if let Some(current) = self.percents.get_mut(index) {
            if let Some(percent) = event.percent() {
                *current = current.max(percent.clamp(0.0, 100.0));
            } else if event.status.to_lowercase().contains("download complete") {
                *current = 100.0;
            }
        }
        self.phase_percent()
    }

    /// Mark the image at `index` as fully pulled
    pub fn finish(&mut self, index: usize) -> f64 {
        if let Some(current) = self.percents.get_mut(index) {
            *current = 100.0;
        }
        self.phase_percent()
    }

    /// Percent of the image at `index`
    pub fn image_percent(&self, index: usize) -> Option<f64> {
        self.percents.get(index).copied()
    }

    /// Unweighted mean across images; an empty pull is complete
    pub fn phase_percent(&self) -> f64 {
        if self.percents.is_empty() {
            return 100.0;
        }
        self.percents.iter().sum::<f64>() / self.percents.len() as f64
    }
}

/// A progress report emitted while pulling
#[derive(Debug, Clone)]
pub struct PullUpdate<'a> {
    pub image: &'a str,
    pub event: Option<&'a PullEvent>,
    pub phase_percent: f64,
}

/// Pull `images` one after the other, reporting after every event.
///
/// Stops at the first failed pull.
pub async fn pull_images<F>(
    engine: &dyn ContainerEngine,
    images: &[String],
    mut report: F,
) -> Result<(), StoreError>
where
    F: FnMut(PullUpdate<'_>) + Send,
{
    let mut progress = PullProgress::new(images.len());

    for (index, image) in images.iter().enumerate() {
        engine
            .pull_image(image, &mut |event: PullEvent| {
                let phase_percent = progress.update(index, &event);
                report(PullUpdate {
                    image,
                    event: Some(&event),
                    phase_percent,
                });
            })
            .await?;

        let phase_percent = progress.finish(index);
        report(PullUpdate {
            image,
            event: None,
            phase_percent,
        });
    }

    Ok(())
}
