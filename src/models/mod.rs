mod api;

pub use api::{
    EchoResponse, HealthResponse, IdentityResponse, IpRuleChange, IpRuleRequest, TokenResponse,
};
