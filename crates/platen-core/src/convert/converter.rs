//! The per-pipeline conversion driver.
//!
//! A [`ToolsetConverter`] is the instance the affinity executor owns: it
//! holds the loaded toolset and walks one document at a time through the
//! engine's settings → converter → objects → perform → output sequence.

use crate::document::Document;
use crate::error::{Error, Result};
use crate::toolset::{ConversionEvent, ConverterHandle, EventSink, Toolset};

pub struct ToolsetConverter<T: Toolset> {
    toolset: T,
    events: EventSink,
}

impl<T: Toolset> ToolsetConverter<T> {
    /// Wrap an already-loaded toolset.
    pub fn new(toolset: T, events: EventSink) -> Self {
        Self { toolset, events }
    }

    pub fn toolset_mut(&mut self) -> &mut T {
        &mut self.toolset
    }

    /// Run one conversion. The converter object is destroyed on every exit
    /// path so its pinned callbacks never outlive it.
    pub fn convert(&mut self, document: &Document) -> Result<Vec<u8>> {
        (self.events)(&ConversionEvent::Begin {
            objects: document.objects.len(),
        });

        let global = self.toolset.create_global_settings()?;
        for (name, value) in document.global.pairs() {
            if !self.toolset.set_global_setting(global, &name, &value)? {
                tracing::warn!(name, value, "engine rejected global setting");
            }
        }
        let converter = self.toolset.create_converter(global)?;

        let result = self.convert_with(converter, document);
        if let Err(e) = self.toolset.destroy_converter(converter) {
            tracing::warn!("failed to destroy converter: {}", e);
        }
        result
    }

    fn convert_with(&mut self, converter: ConverterHandle, document: &Document) -> Result<Vec<u8>> {
        self.toolset.register_events(converter, self.events.clone())?;

        for object in &document.objects {
            let settings = self.toolset.create_object_settings()?;
            for (name, value) in object.settings.pairs() {
                if !self.toolset.set_object_setting(settings, &name, &value)? {
                    tracing::warn!(name, value, "engine rejected object setting");
                }
            }
            self.toolset.add_object(converter, settings, &object.content)?;
        }

        if !self.toolset.perform_conversion(converter)? {
            return Err(Error::Conversion(
                "engine reported conversion failure".to_string(),
            ));
        }
        self.toolset.get_output(converter)
    }
}

impl<T: Toolset> Drop for ToolsetConverter<T> {
    fn drop(&mut self) {
        // Runs on the dedicated thread (graceful dispose) or wherever the
        // pipeline's last reference dies after an abort; unload is
        // best-effort either way.
        if let Err(e) = self.toolset.unload() {
            tracing::warn!("toolset unload on drop failed: {}", e);
        }
    }
}
