pub(crate) mod process;
pub(crate) mod run;
pub(crate) mod sandbox;
