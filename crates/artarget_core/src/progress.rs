use crate::JobPhase;

/// Sub-range of the overall [0, 1] progress owned by one stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageRange {
    pub floor: f32,
    pub ceiling: f32,
}

const LOADING: StageRange = StageRange {
    floor: 0.0,
    ceiling: 0.15,
};
const COMPILING: StageRange = StageRange {
    floor: 0.15,
    ceiling: 0.85,
};
const UPLOADING: StageRange = StageRange {
    floor: 0.85,
    ceiling: 1.0,
};
const DONE: StageRange = StageRange {
    floor: 1.0,
    ceiling: 1.0,
};

/// Returns the progress range a phase reports into, if it reports progress at all.
pub fn stage_range(phase: JobPhase) -> Option<StageRange> {
    match phase {
        JobPhase::Loading => Some(LOADING),
        JobPhase::Compiling => Some(COMPILING),
        JobPhase::Uploading => Some(UPLOADING),
        JobPhase::Completed => Some(DONE),
        JobPhase::Idle | JobPhase::Retrying | JobPhase::Error => None,
    }
}

/// Linearly maps a stage-local percentage (0..=100) into the overall progress value.
///
/// Values above 100 are clamped. Phases without a range map to 0.
pub fn remap(phase: JobPhase, percent: u8) -> f32 {
    let Some(range) = stage_range(phase) else {
        return 0.0;
    };
    let fraction = f32::from(percent.min(100)) / 100.0;
    range.floor + (range.ceiling - range.floor) * fraction
}

/// Progress value a phase starts at.
pub fn floor(phase: JobPhase) -> f32 {
    stage_range(phase).map(|r| r.floor).unwrap_or(0.0)
}
