pub(crate) mod arena;
pub(crate) mod bin;
pub(crate) mod block;
pub(crate) mod bootstrap;
#[cfg(not(loom))]
pub(crate) mod global;
pub(crate) mod large;
pub(crate) mod lifo;
pub(crate) mod loom_tests;
pub(crate) mod scalable;
pub(crate) mod size_class;
pub(crate) mod stats;
pub(crate) mod supply;
pub(crate) mod vm;
