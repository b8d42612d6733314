pub(crate) mod ast;
pub(crate) mod loader;
