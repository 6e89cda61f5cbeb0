// ABOUTME: Database module exports for the feature store and state store
// ABOUTME: Contains SQL Server connection management and the Cosmos DB client

pub mod connection_string;
pub mod cosmos;
pub mod sqlserver;

pub use connection_string::{AuthenticationMode, ConnectionStringError, SqlConnectOptions};
pub use cosmos::{ContainerClient, CosmosClient, CosmosCredential, CosmosError, DatabaseClient};
pub use sqlserver::{Cursor, FeatureStoreConnection, FeatureStoreEngine, SqlServerError};
