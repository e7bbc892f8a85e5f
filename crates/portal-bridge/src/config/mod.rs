pub mod catalog;
pub mod params;
pub mod schema;

pub use catalog::{FieldSpec, GridLayout, RendererInput, ScreenConfig};
pub use params::{ParamDef, Params};
pub use schema::{
    AuditConfig, BrowserConfig, ClassifierConfig, Config, RecordEdit, TargetUrl, Timeouts,
    Viewport,
};
