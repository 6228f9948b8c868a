pub mod audit;
pub mod handlers;
pub mod items;
pub mod middleware;
pub mod orchestrator;
pub mod routes;

pub use routes::create_router;
