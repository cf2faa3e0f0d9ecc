use crate::config::TranscodeSection;

use super::types::QualityRung;

/// The static rung table, ordered by descending vertical resolution. Never
/// mutated at runtime; selection filters it against the probed source.
#[derive(Debug, Clone)]
pub struct QualityLadder {
    rungs: Vec<QualityRung>,
}

impl QualityLadder {
    pub fn from_config(section: &TranscodeSection) -> Self {
        let mut rungs: Vec<QualityRung> = section.rungs.iter().map(QualityRung::from).collect();
        rungs.sort_by(|a, b| b.height.cmp(&a.height));
        Self { rungs }
    }

    pub fn rungs(&self) -> &[QualityRung] {
        &self.rungs
    }

    pub fn names(&self) -> Vec<String> {
        self.rungs.iter().map(|rung| rung.name.clone()).collect()
    }

    /// Rungs to encode for a source of height `source_height`, restricted to
    /// the requested names (empty request means the whole table). Upscaling
    /// is never attempted; when every rung is taller than the source a single
    /// native-height rung is derived from the smallest one so a valid source
    /// always yields at least one output.
    pub fn select(&self, requested: &[String], source_height: u32) -> Vec<QualityRung> {
        let candidates: Vec<&QualityRung> = if requested.is_empty() {
            self.rungs.iter().collect()
        } else {
            self.rungs
                .iter()
                .filter(|rung| requested.iter().any(|name| name == &rung.name))
                .collect()
        };

        let selected: Vec<QualityRung> = candidates
            .iter()
            .filter(|rung| rung.height <= source_height)
            .map(|rung| (*rung).clone())
            .collect();
        if !selected.is_empty() {
            return selected;
        }

        let Some(smallest) = candidates.last().copied().or_else(|| self.rungs.last()) else {
            return Vec::new();
        };
        vec![native_fallback(smallest, source_height)]
    }
}

fn native_fallback(base: &QualityRung, source_height: u32) -> QualityRung {
    // Keep the base rung's aspect ratio, rounded to an even pixel width.
    let width = ((u64::from(source_height) * u64::from(base.width)
        / u64::from(base.height.max(1))) as u32)
        & !1;
    QualityRung {
        name: format!("{source_height}p"),
        width: width.max(2),
        height: source_height,
        video_bitrate_kbps: base.video_bitrate_kbps,
        audio_bitrate_kbps: base.audio_bitrate_kbps,
    }
}
