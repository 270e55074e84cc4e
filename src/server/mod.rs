//! Exposed socket handling.

pub mod listener;
