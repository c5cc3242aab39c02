/// Supplies the bearer token of a secured deployment
pub trait TokenProvider: Send + Sync {
    fn token(&self) -> String;
}

impl<F> TokenProvider for F
where
    F: Fn() -> String + Send + Sync,
{
    fn token(&self) -> String {
        self()
    }
}

/// A token fixed at startup
#[derive(Debug, Clone)]
pub struct StaticToken(pub String);

impl TokenProvider for StaticToken {
    fn token(&self) -> String {
        self.0.clone()
    }
}

/// Value of the authorization header for `token`
pub fn bearer(token: &str) -> String {
    format!("Bearer {token}")
}
