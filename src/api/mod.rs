pub mod routes;
pub mod sse;
