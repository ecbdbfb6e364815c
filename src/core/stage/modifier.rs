//! Applies every registered modification to a source image.

use super::{Outputs, Stage};
use crate::core::decode;
use crate::core::model::{ModifiedImage, SourceImage};
use crate::core::modifier::{save_artifact, Modification, ModificationRegistry};
use crate::core::store::{ReferenceCache, ReferenceKind, Session};
use crate::error::StageError;
use image::DynamicImage;
use std::path::PathBuf;
use std::sync::Arc;

/// `SourceImage` → one `ModifiedImage` per registered modification
pub struct Modifier {
    session: Session,
    references: ReferenceCache,
    registry: ModificationRegistry,
    output_dir: PathBuf,
}

impl Modifier {
    pub fn new(session: Session, registry: ModificationRegistry, output_dir: PathBuf) -> Self {
        Self {
            session,
            references: ReferenceCache::new(),
            registry,
            output_dir,
        }
    }

    fn apply(
        &mut self,
        input: &SourceImage,
        image: &DynamicImage,
        name: &str,
        modification: &dyn Modification,
    ) -> Result<Option<ModifiedImage>, StageError> {
        let modification_id =
            self.references
                .resolve(self.session.store(), ReferenceKind::Modification, name)?;

        let modified = modification.modify(image);
        let path = save_artifact(&self.output_dir, &modified)?;

        let id = self
            .session
            .write(|store| store.insert_modified_image(&path, input.id, modification_id))?;

        match id {
            Some(id) => Ok(Some(ModifiedImage {
                id,
                path,
                source_image_id: input.id,
                modification_id,
            })),
            None => {
                tracing::debug!(
                    image_id = input.id,
                    modification = name,
                    path = %path.display(),
                    "Modified image already stored"
                );
                Ok(None)
            }
        }
    }
}

/// Walks the registry for one decoded source image
struct ModifiedImages<'a> {
    stage: &'a mut Modifier,
    input: &'a SourceImage,
    image: DynamicImage,
    next_index: usize,
    finished: bool,
}

impl Iterator for ModifiedImages<'_> {
    type Item = Result<ModifiedImage, StageError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.finished {
            let Some((name, modification)) = self
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
                .apply(self.input, &self.image, &name, modification.as_ref())
            {
                Ok(Some(record)) => return Some(Ok(record)),
                Ok(None) => continue,
                Err(e) => {
                    self.finished = e.is_fatal();
                    return Some(Err(e));
                }
            }
        }
        None
    }
}

impl Stage for Modifier {
    type Input = SourceImage;
    type Output = ModifiedImage;

    const NAME: &'static str = "modifier";

    fn process<'a>(&'a mut self, input: &'a SourceImage) -> Outputs<'a, ModifiedImage> {
        let image = match decode::decode(&input.path) {
            Ok(image) => image,
            Err(e) => {
                return Box::new(std::iter::once(Err(StageError::PermanentInput {
                    record: format!("image {}", input.id),
                    reason: e.to_string(),
                })));
            }
        };

        Box::new(ModifiedImages {
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
