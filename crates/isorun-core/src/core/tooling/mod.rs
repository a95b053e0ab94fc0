pub(crate) mod timings;
