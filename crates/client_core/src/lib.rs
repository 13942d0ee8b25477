pub mod credentials;
pub mod dashboard;
pub mod session;
pub mod transport;

pub use credentials::{CredentialStore, DurableCredentialStore, TokenPair};
pub use dashboard::{
    DashboardEvent, DashboardOrchestrator, DataFetchError, NewsSlice, SliceState, WeatherSlice,
};
pub use session::{
    AuthenticationError, ProfileUpdateError, RegistrationError, SessionEvent, SessionManager,
    SessionState,
};
pub use transport::ApiClient;
