// Licensed under the Apache-2.0 license

#[cfg(test)]
mod test {
    use crate::vbios_builder::{VbiosBuilder, DMEM_SIZE, IMEM_SIZE, IMEM_VIRT_BASE};
    use gsp_bringup::fuse::select_signature;
    use gsp_bringup::BringupError;
    use gsp_config::ADA_CONFIG;
    use gsp_hw_model::EmulatedGpu;
    use gsp_vbios::{extract_fwsec, RSA3K_SIGNATURE_SIZE, VbiosError};

    #[test]
    fn extraction_walks_rom_bit_and_lookup_table() {
        let img = VbiosBuilder::default().build();
        let ucode = extract_fwsec(&img, &[]).unwrap();
        assert_eq!(ucode.desc.ucode_id, 1);
        assert_eq!(ucode.desc.boot_vector(), IMEM_VIRT_BASE);
        assert_eq!(ucode.desc.engine_id_mask, 0x0400);
        assert_eq!(ucode.imem.len(), IMEM_SIZE);
        assert_eq!(ucode.dmem.len(), DMEM_SIZE);
        // Two advertised versions, two signature blocks.
        assert_eq!(ucode.signatures.len(), 2 * RSA3K_SIGNATURE_SIZE);
        assert!(ucode.signature(0).unwrap().iter().all(|&b| b == 0xB0));
        assert!(ucode.signature(1).unwrap().iter().all(|&b| b == 0xB1));
    }

    #[test]
    fn image_at_historical_offset_is_found_by_probe() {
        let img = VbiosBuilder {
            base: 0x9400,
            ..Default::default()
        }
        .build();
        let ucode = extract_fwsec(&img, ADA_CONFIG.known_rom_offsets).unwrap();
        assert_eq!(ucode.desc.ucode_id, 1);
    }

    #[test]
    fn corrupt_descriptor_reports_fwsec_not_found() {
        let mut img = VbiosBuilder::default().build();
        // Wipe the descriptor; both lookup candidates now fail
        // validation and the walk exhausts the table.
        img[0x200..0x22C].fill(0);
        assert_eq!(extract_fwsec(&img, &[]).unwrap_err(), VbiosError::FwsecNotFound);
    }

    #[test]
    fn fuse_version_without_signature_is_unavailable() {
        // The image only carries a version-2 signature; unblown fuses
        // mean version 1, which has no matching block.
        let img = VbiosBuilder {
            signature_versions: 0x2,
            ..Default::default()
        }
        .build();
        let ucode = extract_fwsec(&img, &[]).unwrap();

        let mut dev = EmulatedGpu::new(&ADA_CONFIG);
        let err = select_signature(&mut dev, &ADA_CONFIG, &ucode.desc).unwrap_err();
        assert_eq!(
            err,
            BringupError::SignatureUnavailable {
                fuse_version: 1,
                signature_versions: 0x2,
            }
        );
    }

    #[test]
    fn blown_fuse_selects_the_matching_signature_block() {
        let img = VbiosBuilder::default().build();
        let ucode = extract_fwsec(&img, &[]).unwrap();

        let mut dev = EmulatedGpu::new(&ADA_CONFIG);
        dev.set_fuse_version(ADA_CONFIG.fuse_gsp_ucode_version_base, 1, 0b10);
        let selection = select_signature(&mut dev, &ADA_CONFIG, &ucode.desc).unwrap();
        assert_eq!(selection.version, 2);
        assert_eq!(selection.index, 1);
    }
}
