//! Property-based tests for grouping and master selection

mod grouping;
