//! Hashes modified images with every registered method.

use super::{Outputs, Stage};
use crate::core::decode;
use crate::core::hasher::{HashMethod, HashRegistry};
use crate::core::model::{ImageHash, ModifiedImage};
use crate::core::store::{ReferenceCache, ReferenceKind, Session};
use crate::error::StageError;
use image::DynamicImage;
use std::sync::Arc;

/// `ModifiedImage` → one `ImageHash` per registered hash method
pub struct Hasher {
    session: Session,
    references: ReferenceCache,
    registry: HashRegistry,
}

impl Hasher {
    pub fn new(session: Session, registry: HashRegistry) -> Self {
        Self {
            session,
            references: ReferenceCache::new(),
            registry,
        }
    }

    fn hash_with(
        &mut self,
        input: &ModifiedImage,
        image: &DynamicImage,
        name: &str,
        method: &dyn HashMethod,
    ) -> Result<Option<ImageHash>, StageError> {
        let hash_method_id =
            self.references
                .resolve(self.session.store(), ReferenceKind::HashMethod, name)?;

        let value = method
            .hash_image(image)
            .map_err(|e| StageError::PermanentInput {
                record: format!("modified image {} ({})", input.id, name),
                reason: e.to_string(),
            })?;

        let id = self
            .session
            .write(|store| store.insert_hash(&value, input.id, hash_method_id))?;

        Ok(id.map(|id| ImageHash {
            id,
            value,
            modified_image_id: input.id,
            hash_method_id,
        }))
    }
}

/// Walks the registry for one decoded modified image
struct ImageHashes<'a> {
    stage: &'a mut Hasher,
    input: &'a ModifiedImage,
    image: DynamicImage,
    next_index: usize,
    finished: bool,
}

impl Iterator for ImageHashes<'_> {
    type Item = Result<ImageHash, StageError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.finished {
            let Some((name, method)) = self
                .stage
                .registry
                .entry(self.next_index)
                .map(|(name, m)| (name.to_string(), Arc::clone(m)))
            else {
                self.finished = true;
                break;
            };
            self.next_index += 1;

            match self
                .stage
                .hash_with(self.input, &self.image, &name, method.as_ref())
            {
                Ok(Some(hash)) => return Some(Ok(hash)),
                Ok(None) => {
                    tracing::debug!(
                        modified_image_id = self.input.id,
                        method = %name,
                        "Hash already stored"
                    );
                }
                Err(e) => {
                    // A failing method only skips its own hash
                    self.finished = e.is_fatal();
                    return Some(Err(e));
                }
            }
        }
        None
    }
}

impl Stage for Hasher {
    type Input = ModifiedImage;
    type Output = ImageHash;

    const NAME: &'static str = "hasher";

    fn process<'a>(&'a mut self, input: &'a ModifiedImage) -> Outputs<'a, ImageHash> {
        let image = match decode::decode(&input.path) {
            Ok(image) => image,
            Err(e) => {
                return Box::new(std::iter::once(Err(StageError::PermanentInput {
                    record: format!("modified image {}", input.id),
                    reason: e.to_string(),
                })));
            }
        };

        Box::new(ImageHashes {
            stage: self,
            input,
            image,
            next_index: 0,
            finished: false,
        })
    }

    fn flush(&mut self) -> Result<(), StageError> {
        Ok(self.session.flush()?)
    }
}
