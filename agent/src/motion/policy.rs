/// Side effects requested by the motion trigger or by remote reconciliation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Action {
    /// Report the magnitude to the server.
    ReportMotion(f64),
    StartRecording,
    StopRecording,
}

/// Map a sampled magnitude to actions.
///
/// Motion above `threshold` is always reported; a start is requested only
/// while idle. This policy never stops a recording.
pub fn evaluate_trigger_policy(
    magnitude: Option<f64>,
    recording_active: bool,
    threshold: f64,
) -> Vec<Action> {
    let mut actions = Vec::new();
    if let Some(m) = magnitude.filter(|m| *m > threshold) {
        actions.push(Action::ReportMotion(m));
        if !recording_active {
            actions.push(Action::StartRecording);
        }
    }
    actions
}

/// Align local recording state with the state the server asks for.
pub fn reconcile_remote_state(desired_recording: bool, actual_recording: bool) -> Option<Action> {
    match (desired_recording, actual_recording) {
        (true, false) => Some(Action::StartRecording),
        (false, true) => Some(Action::StopRecording),
        _ => None,
    }
}
