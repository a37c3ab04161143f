pub mod factory;
pub mod orchestrator;
pub mod selector;
pub mod stage;

pub use factory::{Factory, FactoryMode, FrameRequest};
pub use orchestrator::Orchestrator;
pub use selector::{
    CaptureSelector, KeptBuffer, SelectorEntry, SELECT_RETRY_HDR, SELECT_RETRY_NORMAL,
};
pub use stage::{PassthroughStage, Stage, StageRunner};
