// ABOUTME: Azure identity support for the feature store and state store
// ABOUTME: Token credentials, the default credential chain and ODBC token packing

pub mod azure_cli;
pub mod credential;
pub mod environment;
pub mod managed_identity;
pub mod token;

pub use azure_cli::AzureCliCredential;
pub use credential::{
    AccessToken, CredentialError, DefaultAzureCredential, StaticTokenCredential, TokenCredential,
};
pub use environment::{EnvironmentCredential, WorkloadIdentityCredential};
pub use managed_identity::{IdentitySource, ManagedIdentityCredential};
pub use token::{
    db_aad_token_struct, pack_access_token, unpack_access_token, ConnectAttrs, TokenError,
    DATABASE_SCOPE, SQL_COPT_SS_ACCESS_TOKEN,
};
