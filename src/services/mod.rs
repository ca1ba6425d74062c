pub mod exerciser;

pub use exerciser::{Exerciser, ExerciserSettings, Pause, RunSummary, TokioPause};
