use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl From<Error> for parley_common::Error {
    fn from(err: Error) -> Self {
        Self::store(err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
