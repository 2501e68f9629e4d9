//! App template lookup

pub mod resolver;

pub use resolver::{FileTemplateResolver, StaticTemplateResolver, TemplateResolver};
