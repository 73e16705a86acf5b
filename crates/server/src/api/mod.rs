pub mod audit;
pub mod handlers;
pub mod middleware;
pub mod operations;
pub mod orchestrator;
pub mod routes;

pub use routes::create_router;
