//! Integration tests: full cycles through the engine with in-memory
//! collaborators.

mod full_cycle;
mod mock_sources;
