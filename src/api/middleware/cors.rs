//! CORS middleware configuration.

use tower_http::cors::CorsLayer;

/// Create a CORS layer allowing every origin, method and header.
pub fn create_cors_layer() -> CorsLayer {
    CorsLayer::permissive()
}
