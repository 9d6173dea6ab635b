use {
    super::{word, ActionOutput},
    crate::{
        command::BufferImageCopy,
        decode::{CopyBufferToImageError, GpuError},
        resource::CopyImageFormat,
        settings::Settings,
        wire::CopyBufferToImagePushConstants,
    },
};

/// One set of constants per region. Empty when the copy needs no checks.
pub(crate) fn copy_buffer_to_image_constants(
    format: CopyImageFormat,
    regions: &[BufferImageCopy],
    settings: &Settings,
) -> Vec<CopyBufferToImagePushConstants> {
    if !settings.validate_buffer_copies || !format.is_float_depth() {
        return Vec::new();
    }

    let texel_stride_words = (format.texel_size() / 4).max(1);
    regions
        .iter()
        .enumerate()
        .filter(|(_, region)| region.image_extent.iter().all(|&e| e > 0))
        .map(|(index, region)| CopyBufferToImagePushConstants {
            offset_words: (region.buffer_offset / 4) as u32,
            row_texels: region.row_texels(),
            image_rows: region.image_rows(),
            region_index: index as u32,
            extent: region.image_extent,
            texel_stride_words,
        })
        .collect()
}

/// Device half of depth copy validation. `src` is the source buffer.
pub fn evaluate_copy_buffer_to_image(
    pc: &CopyBufferToImagePushConstants,
    src: &[u32],
    out: &mut ActionOutput<'_>,
) {
    let [width, height, depth] = pc.extent;
    let mut texel = 0u32;
    for z in 0..u64::from(depth) {
        for y in 0..u64::from(height) {
            for x in 0..u64::from(width) {
                let index = (z * u64::from(pc.image_rows) + y) * u64::from(pc.row_texels) + x;
                let at = u64::from(pc.offset_words) + index * u64::from(pc.texel_stride_words);
                let bits = word(src, at);
                let value = f32::from_bits(bits);
                if !(0.0..=1.0).contains(&value) {
                    let stored = out.report(GpuError::CopyBufferToImage(
                        CopyBufferToImageError::DepthTexelRange {
                            texel,
                            bits,
                            region: pc.region_index,
                        },
                    ));
                    if !stored {
                        return;
                    }
                }
                texel = texel.wrapping_add(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            decode::{walk_records, ErrorRecord},
            wire::{output, CommandIndices, RECORD_WORDS},
        },
    };

    #[test]
    fn only_float_depth_is_checked() {
        let region = BufferImageCopy {
            image_extent: [2, 2, 1],
            ..BufferImageCopy::default()
        };
        let settings = Settings::default();
        assert!(copy_buffer_to_image_constants(
            CopyImageFormat::Other { texel_size: 4 },
            &[region],
            &settings
        )
        .is_empty());

        let constants =
            copy_buffer_to_image_constants(CopyImageFormat::D32SfloatS8Uint, &[region, region], &settings);
        assert_eq!(constants.len(), 2);
        assert_eq!(constants[1].region_index, 1);
        assert_eq!(constants[1].row_texels, 2);
    }

    #[test]
    fn reports_texels_outside_unit_range() {
        let region = BufferImageCopy {
            buffer_offset: 4,
            buffer_row_length: 3,
            image_extent: [2, 2, 1],
            ..BufferImageCopy::default()
        };
        let constants =
            copy_buffer_to_image_constants(CopyImageFormat::D32Sfloat, &[region], &Settings::default());

        // Rows of 3 texels, only 2 copied per row.
        let src: Vec<u32> = [0.0f32, 0.5, 1.0, 7.0, 0.25, -1.0, 9.0]
            .iter()
            .map(|v| v.to_bits())
            .collect();

        let mut buffer = vec![0u32; output::DATA + 4 * RECORD_WORDS];
        let mut counts = vec![0u32; 1];
        let indices = CommandIndices {
            max_errors: 4,
            ..CommandIndices::default()
        };
        let mut out = ActionOutput::new(&mut buffer, &mut counts, indices);
        evaluate_copy_buffer_to_image(&constants[0], &src, &mut out);

        let written = buffer[output::WRITTEN];
        let errors: Vec<_> = walk_records(&buffer[output::DATA..], written)
            .map(|record| ErrorRecord::decode(record).unwrap().error)
            .collect();
        assert_eq!(
            errors,
            [GpuError::CopyBufferToImage(
                CopyBufferToImageError::DepthTexelRange {
                    texel: 3,
                    bits: (-1.0f32).to_bits(),
                    region: 0,
                }
            )]
        );
    }
}
