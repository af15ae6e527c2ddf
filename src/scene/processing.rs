//! Dark/flat field correction of stored projections.

use super::Scene;
use crate::types::FrameClass;

impl Scene {
    /// Projection `index` after flat-field correction and negative log.
    ///
    /// Correction is `(p - dark) / (flat - dark)` with per-pixel averages over
    /// all stored darks and flats of the detector shape. It needs at least one
    /// of each; otherwise the raw values pass through. The negative log maps
    /// `x <= 0` to `0` and is skipped for already linear scans.
    pub fn corrected_projection(&self, index: u32) -> Option<Vec<f32>> {
        let frame = self.frame(FrameClass::Projection, index)?;
        let mut data = frame.data.clone();

        let dark = self.averages.get(&(FrameClass::Dark, frame.shape));
        let flat = self.averages.get(&(FrameClass::Flat, frame.shape));
        if let (Some(dark), Some(flat)) = (dark, flat) {
            flat_field(&mut data, dark, flat);
        }
        if !self.settings.already_linear {
            neg_log(&mut data);
        }
        Some(data)
    }

    /// Recompute the per-pixel mean of all `class` frames shaped `shape`.
    ///
    /// Runs when a dark or flat is stored, so projections read the cached mean.
    pub(super) fn refresh_average(&mut self, class: FrameClass, shape: [u32; 2]) {
        let len = shape[0] as usize * shape[1] as usize;
        let mut sum = vec![0f32; len];
        let mut samples = 0u32;
        for (_, frame) in self.frames(class).filter(|(_, f)| f.shape == shape) {
            for (acc, value) in sum.iter_mut().zip(&frame.data) {
                *acc += value;
            }
            samples += 1;
        }

        if samples == 0 {
            self.averages.remove(&(class, shape));
            return;
        }
        let scale = 1.0 / samples as f32;
        sum.iter_mut().for_each(|v| *v *= scale);
        self.averages.insert((class, shape), sum.into());
    }
}

fn flat_field(data: &mut [f32], dark: &[f32], flat: &[f32]) {
    for ((p, d), f) in data.iter_mut().zip(dark).zip(flat) {
        let reciprocal = if d == f { 1.0 } else { 1.0 / (f - d) };
        *p = (*p - d) * reciprocal;
    }
}

fn neg_log(data: &mut [f32]) {
    for v in data.iter_mut() {
        *v = if *v <= 0.0 { 0.0 } else { -v.ln() };
    }
}
