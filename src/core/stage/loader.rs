//! Registers discovered files as source images.

use super::{Outputs, Stage};
use crate::core::model::{ImagePath, SourceImage};
use crate::core::store::{ReferenceCache, ReferenceKind, Session};
use crate::error::StageError;

/// `ImagePath` → `SourceImage`
///
/// Resolves the owner to a user row, then inserts the image. A path that
/// is already registered for the same owner produces nothing.
pub struct Loader {
    session: Session,
    references: ReferenceCache,
}

impl Loader {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            references: ReferenceCache::new(),
        }
    }

    fn load(&mut self, input: &ImagePath) -> Result<Option<SourceImage>, StageError> {
        let owner_id =
            self.references
                .resolve(self.session.store(), ReferenceKind::User, &input.owner)?;

        let id = self
            .session
            .write(|store| store.insert_image(&input.path, owner_id))?;

        match id {
            Some(id) => Ok(Some(SourceImage {
                id,
                path: input.path.clone(),
                owner_id,
            })),
            None => {
                tracing::debug!(path = %input.path.display(), "Image already registered");
                Ok(None)
            }
        }
    }
}

impl Stage for Loader {
    type Input = ImagePath;
    type Output = SourceImage;

    const NAME: &'static str = "loader";

    fn process<'a>(&'a mut self, input: &'a ImagePath) -> Outputs<'a, SourceImage> {
        Box::new(self.load(input).transpose().into_iter())
    }

    fn flush(&mut self) -> Result<(), StageError> {
        Ok(self.session.flush()?)
    }
}
