mod descriptor;
mod label;
mod layout;

pub use descriptor::{read_class_names, DescriptorDocument, TrainSource, UnifiedDescriptor, DESCRIPTOR_FILE};
pub use label::{leading_class_id, remap_label_file};
pub use layout::{
    label_path_for_image, list_images_by_extension, list_split_images, DatasetSplit, SplitDirs,
    IMAGES_DIR, LABELS_DIR, LABEL_EXTENSION,
};
