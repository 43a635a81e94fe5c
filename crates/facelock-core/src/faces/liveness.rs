use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::capture::FrameStream;
use crate::errors::{AppError, AppResult};
use crate::faces::comparer::{best_match, first_match, TemplateMatch};
use crate::faces::extractor::{FeatureExtractor, DEFAULT_CROP_SIZE};
use crate::faces::locator::{crop_face, FaceLocator};
use crate::faces::store::TemplateSet;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LivenessConfig {
    pub tolerance: f64,
    pub matches_required: u32,
    pub window: Duration,
    pub frame_skip: u32,
    pub canonical_crop_size: (u32, u32),
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            tolerance: 0.7,
            matches_required: 3,
            window: Duration::from_secs(5),
            frame_skip: 2,
            canonical_crop_size: DEFAULT_CROP_SIZE,
        }
    }
}

/// Monotonic time since an arbitrary fixed origin.
pub trait Clock {
    fn now(&self) -> Duration;
}

#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchProgress {
    pub count: u32,
    pub required: u32,
    pub matched: TemplateMatch,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LivenessOutcome {
    pub accepted: bool,
    pub matches: u32,
    pub required: u32,
    pub frames_delivered: u64,
    pub frames_processed: u64,
    /// Processed frames in which at least one face was located.
    pub frames_with_face: u64,
    pub faces_detected: u64,
    pub matched_templates: Vec<TemplateMatch>,
    /// Highest similarity among faces that matched no template.
    pub closest_miss: Option<f64>,
    pub elapsed: Duration,
}

/// Turns a stream of frames into an accept/reject decision.
///
/// Every call to [`LivenessEngine::evaluate`] starts from zero; nothing is
/// carried between attempts.
pub struct LivenessEngine<C = SystemClock> {
    config: LivenessConfig,
    extractor: FeatureExtractor,
    clock: C,
}

impl LivenessEngine<SystemClock> {
    pub fn new(config: LivenessConfig) -> AppResult<Self> {
        Self::with_clock(config, SystemClock::default())
    }
}

impl<C: Clock> LivenessEngine<C> {
    pub fn with_clock(config: LivenessConfig, clock: C) -> AppResult<Self> {
        if config.matches_required == 0 {
            return Err(AppError::Precondition(
                "matches_required must be at least 1".into(),
            ));
        }
        if config.frame_skip == 0 {
            return Err(AppError::Precondition("frame_skip must be at least 1".into()));
        }
        Ok(Self {
            extractor: FeatureExtractor::new(config.canonical_crop_size)?,
            config,
            clock,
        })
    }

    pub fn evaluate<L>(
        &self,
        frames: &mut dyn FrameStream,
        locator: &mut L,
        templates: &TemplateSet,
    ) -> AppResult<LivenessOutcome>
    where
        L: FaceLocator + ?Sized,
    {
        self.evaluate_observed(frames, locator, templates, |_| {})
    }

    /// Like [`evaluate`](Self::evaluate), reporting each match as it happens.
    pub fn evaluate_observed<L, F>(
        &self,
        frames: &mut dyn FrameStream,
        locator: &mut L,
        templates: &TemplateSet,
        mut on_match: F,
    ) -> AppResult<LivenessOutcome>
    where
        L: FaceLocator + ?Sized,
        F: FnMut(&MatchProgress),
    {
        if templates.feature_len() != self.extractor.feature_len() {
            return Err(AppError::Precondition(format!(
                "templates hold {} values but the {}x{} crop yields {}; re-enroll",
                templates.feature_len(),
                self.config.canonical_crop_size.0,
                self.config.canonical_crop_size.1,
                self.extractor.feature_len()
            )));
        }

        let required = self.config.matches_required;
        let skip = u64::from(self.config.frame_skip);
        let start = self.clock.now();
        let mut matches = 0u32;
        let mut frames_delivered = 0u64;
        let mut frames_processed = 0u64;
        let mut frames_with_face = 0u64;
        let mut faces_detected = 0u64;
        let mut matched_templates = Vec::new();
        let mut closest_miss: Option<f64> = None;

        let mut elapsed = Duration::ZERO;
        while elapsed < self.config.window && matches < required {
            let next = frames.next_frame()?;
            elapsed = self.clock.now().saturating_sub(start);
            let Some(frame) = next else {
                continue;
            };

            frames_delivered += 1;
            if frames_delivered % skip != 0 {
                continue;
            }
            frames_processed += 1;

            let faces = locator.locate(&frame)?;
            faces_detected += faces.len() as u64;
            if !faces.is_empty() {
                frames_with_face += 1;
            }
            for face in &faces {
                let Some(crop) = crop_face(&frame, face) else {
                    continue;
                };
                let candidate = self.extractor.extract(&crop)?;
                let found = first_match(&candidate, templates.features(), self.config.tolerance);
                if let Some(found) = found {
                    matches += 1;
                    info!(
                        count = matches,
                        required,
                        template = found.template_index,
                        similarity = found.similarity,
                        "face match"
                    );
                    matched_templates.push(found);
                    on_match(&MatchProgress {
                        count: matches,
                        required,
                        matched: found,
                    });
                } else if let Some(nearest) = best_match(&candidate, templates.features()) {
                    debug!(
                        template = nearest.template_index,
                        similarity = nearest.similarity,
                        "face below tolerance"
                    );
                    closest_miss = Some(
                        closest_miss.map_or(nearest.similarity, |best| best.max(nearest.similarity)),
                    );
                }
            }
            elapsed = self.clock.now().saturating_sub(start);
        }

        if frames_delivered == 0 {
            return Err(AppError::Acquisition {
                device: frames.source_name().to_string(),
                message: format!(
                    "no frame delivered within {:.1}s",
                    self.config.window.as_secs_f64()
                ),
            });
        }

        let accepted = matches >= required;
        info!(
            accepted,
            matches,
            required,
            valid_detections = frames_with_face,
            frames = frames_delivered,
            elapsed_ms = elapsed.as_millis() as u64,
            "liveness evaluation finished"
        );
        debug!(
            processed = frames_processed,
            faces = faces_detected,
            "frames passed to the face locator"
        );

        Ok(LivenessOutcome {
            accepted,
            matches,
            required,
            frames_delivered,
            frames_processed,
            frames_with_face,
            faces_detected,
            matched_templates,
            closest_miss,
            elapsed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::faces::locator::BoundingBox;
    use crate::faces::store::Template;
    use image::{GrayImage, Luma};
    use std::cell::Cell;
    use std::rc::Rc;

    #[derive(Clone, Default)]
    struct FakeClock(Rc<Cell<Duration>>);

    impl FakeClock {
        fn advance(&self, by: Duration) {
            self.0.set(self.0.get() + by);
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> Duration {
            self.0.get()
        }
    }

    /// Yields frames from `pattern` cyclically, advancing the clock per frame.
    struct ScriptedStream {
        clock: FakeClock,
        step: Duration,
        pattern: Vec<Option<GrayImage>>,
        served: usize,
    }

    impl FrameStream for ScriptedStream {
        fn next_frame(&mut self) -> AppResult<Option<GrayImage>> {
            self.clock.advance(self.step);
            let frame = self.pattern[self.served % self.pattern.len()].clone();
            self.served += 1;
            Ok(frame)
        }

        fn source_name(&self) -> &str {
            "scripted"
        }
    }

    /// Reports a face only for frames whose top-left pixel is bright.
    #[derive(Default)]
    struct CountingLocator {
        calls: usize,
    }

    impl FaceLocator for CountingLocator {
        fn locate(&mut self, frame: &GrayImage) -> AppResult<Vec<BoundingBox>> {
            self.calls += 1;
            if frame.get_pixel(0, 0)[0] > 0 {
                Ok(vec![BoundingBox::new(0, 0, frame.width() as i64, frame.height() as i64)])
            } else {
                Ok(Vec::new())
            }
        }
    }

    fn face_frame() -> GrayImage {
        GrayImage::from_fn(64, 64, |x, y| {
            if x == 0 && y == 0 {
                Luma([255])
            } else {
                Luma([((x * 13 + y * 7) % 200) as u8 + 30])
            }
        })
    }

    fn stranger_frame() -> GrayImage {
        GrayImage::from_fn(64, 64, |x, y| {
            if x == 0 && y == 0 {
                Luma([255])
            } else {
                Luma([((x * 5 + y * 31) % 97) as u8 * 2])
            }
        })
    }

    fn templates_for(frame: &GrayImage) -> TemplateSet {
        let features = FeatureExtractor::default().extract(frame).unwrap();
        TemplateSet::new(vec![Template::new("neutral", features)]).unwrap()
    }

    fn engine(clock: &FakeClock, frame_skip: u32) -> LivenessEngine<FakeClock> {
        LivenessEngine::with_clock(
            LivenessConfig {
                frame_skip,
                ..LivenessConfig::default()
            },
            clock.clone(),
        )
        .unwrap()
    }

    fn stream(clock: &FakeClock, pattern: Vec<Option<GrayImage>>) -> ScriptedStream {
        ScriptedStream {
            clock: clock.clone(),
            step: Duration::from_millis(100),
            pattern,
            served: 0,
        }
    }

    #[test]
    fn matching_face_accepts_within_required_processed_frames() {
        let clock = FakeClock::default();
        let templates = templates_for(&face_frame());
        let mut frames = stream(&clock, vec![Some(face_frame())]);
        let mut locator = CountingLocator::default();

        let mut progress = Vec::new();
        let outcome = engine(&clock, 1)
            .evaluate_observed(&mut frames, &mut locator, &templates, |p| progress.push(p.count))
            .unwrap();

        assert!(outcome.accepted);
        assert_eq!(outcome.matches, 3);
        assert_eq!(outcome.frames_processed, 3);
        assert!(outcome.elapsed < Duration::from_secs(1));
        assert_eq!(progress, vec![1, 2, 3]);
        assert!(outcome.matched_templates.iter().all(|m| m.template_index == 0));
        assert_eq!(outcome.closest_miss, None);
    }

    #[test]
    fn non_matching_face_rejects_at_window() {
        let clock = FakeClock::default();
        let templates = templates_for(&face_frame());
        let mut frames = stream(&clock, vec![Some(stranger_frame())]);
        let mut locator = CountingLocator::default();

        let outcome = engine(&clock, 1)
            .evaluate(&mut frames, &mut locator, &templates)
            .unwrap();

        assert!(!outcome.accepted);
        assert_eq!(outcome.matches, 0);
        assert!(outcome.elapsed >= Duration::from_secs(5));
        assert!(outcome.elapsed <= Duration::from_secs(5) + Duration::from_millis(100));
        assert_eq!(outcome.faces_detected, outcome.frames_processed);
        assert_eq!(outcome.frames_with_face, outcome.frames_processed);
        let closest = outcome.closest_miss.expect("stranger was scored");
        assert!((0.0..0.7).contains(&closest));
    }

    #[test]
    fn one_match_short_rejects() {
        let clock = FakeClock::default();
        let templates = templates_for(&face_frame());
        // Two matches early, then strangers until the window closes.
        let mut pattern = vec![Some(face_frame()), Some(face_frame())];
        pattern.extend(std::iter::repeat(Some(stranger_frame())).take(200));
        let mut frames = stream(&clock, pattern);
        let mut locator = CountingLocator::default();

        let outcome = engine(&clock, 1)
            .evaluate(&mut frames, &mut locator, &templates)
            .unwrap();
        assert!(!outcome.accepted);
        assert_eq!(outcome.matches, 2);
    }

    #[test]
    fn frame_skip_limits_locator_calls() {
        let clock = FakeClock::default();
        let templates = templates_for(&face_frame());
        let mut frames = stream(&clock, vec![Some(stranger_frame())]);
        let mut locator = CountingLocator::default();

        let outcome = engine(&clock, 3)
            .evaluate(&mut frames, &mut locator, &templates)
            .unwrap();

        assert_eq!(outcome.frames_delivered, 50);
        assert_eq!(locator.calls as u64, outcome.frames_delivered / 3);
        assert_eq!(outcome.frames_processed, locator.calls as u64);
    }

    #[test]
    fn unavailable_frames_are_not_counted() {
        let clock = FakeClock::default();
        let templates = templates_for(&face_frame());
        let mut frames = stream(&clock, vec![None, Some(face_frame())]);
        let mut locator = CountingLocator::default();

        let outcome = engine(&clock, 2)
            .evaluate(&mut frames, &mut locator, &templates)
            .unwrap();
        assert!(outcome.accepted);
        assert_eq!(outcome.frames_delivered, 6);
        assert_eq!(locator.calls, 3);
    }

    #[test]
    fn frames_without_faces_are_absorbed() {
        let clock = FakeClock::default();
        let templates = templates_for(&face_frame());
        let empty = GrayImage::new(64, 64);
        let mut frames = stream(&clock, vec![Some(empty), Some(face_frame())]);
        let mut locator = CountingLocator::default();

        let outcome = engine(&clock, 1)
            .evaluate(&mut frames, &mut locator, &templates)
            .unwrap();
        assert!(outcome.accepted);
        assert_eq!(outcome.frames_processed, 6);
        assert_eq!(outcome.frames_with_face, 3);
    }

    #[test]
    fn every_face_in_frame_counts_once() {
        struct TwoFaces;
        impl FaceLocator for TwoFaces {
            fn locate(&mut self, _frame: &GrayImage) -> AppResult<Vec<BoundingBox>> {
                let whole = BoundingBox::new(0, 0, 64, 64);
                Ok(vec![whole, whole])
            }
        }

        let clock = FakeClock::default();
        let frame = face_frame();
        let features = FeatureExtractor::default().extract(&frame).unwrap();
        let templates = TemplateSet::new(vec![
            Template::new("a", features.clone()),
            Template::new("b", features),
        ])
        .unwrap();
        let mut frames = stream(&clock, vec![Some(frame)]);

        let outcome = engine(&clock, 1)
            .evaluate(&mut frames, &mut TwoFaces, &templates)
            .unwrap();
        assert_eq!(outcome.frames_processed, 2);
        assert_eq!(outcome.frames_with_face, 2);
        assert_eq!(outcome.faces_detected, 4);
        assert_eq!(outcome.matches, 4);
        assert!(outcome.matched_templates.iter().all(|m| m.template_index == 0));
    }

    #[test]
    fn no_delivered_frames_is_an_acquisition_error() {
        let clock = FakeClock::default();
        let templates = templates_for(&face_frame());
        let mut frames = stream(&clock, vec![None]);
        let mut locator = CountingLocator::default();

        let err = engine(&clock, 1)
            .evaluate(&mut frames, &mut locator, &templates)
            .unwrap_err();
        assert!(err.is_acquisition());
        assert_eq!(locator.calls, 0);
    }

    #[test]
    fn mismatched_template_length_is_rejected_up_front() {
        let clock = FakeClock::default();
        let templates = TemplateSet::new(vec![Template::new(
            "tiny",
            crate::faces::extractor::FeatureVector::new(vec![0.1, 0.2, 0.3]),
        )])
        .unwrap();
        let mut frames = stream(&clock, vec![Some(face_frame())]);
        let err = engine(&clock, 1)
            .evaluate(&mut frames, &mut CountingLocator::default(), &templates)
            .unwrap_err();
        assert!(matches!(err, AppError::Precondition(_)));
    }

    #[test]
    fn evaluations_are_independent() {
        let clock = FakeClock::default();
        let templates = templates_for(&face_frame());
        let engine = engine(&clock, 1);
        let mut locator = CountingLocator::default();
        for _ in 0..2 {
            let mut frames = stream(&clock, vec![Some(face_frame())]);
            let outcome = engine.evaluate(&mut frames, &mut locator, &templates).unwrap();
            assert_eq!(outcome.matches, 3);
        }
    }
}
