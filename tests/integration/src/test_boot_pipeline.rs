// Licensed under the Apache-2.0 license

#[cfg(test)]
mod test {
    use crate::vbios_builder::VbiosBuilder;
    use gsp_bringup::rpc::{RpcEvent, FN_GSP_RM_CONTROL, FN_GSP_SET_SYSTEM_INFO};
    use gsp_bringup::wpr::BootloaderSections;
    use gsp_bringup::{BringupError, BringupSession, GspSystemInfo, PrimaryFirmware};
    use gsp_config::ADA_CONFIG;
    use gsp_hw_model::EmulatedGpu;
    use zerocopy::IntoBytes;

    const FRTS_OFFSET: u64 = 0x3FF0_0000;

    fn firmware_images() -> (Vec<u8>, Vec<u8>, Vec<u8>) {
        // An ELF spanning several pages plus a partial tail page.
        let elf: Vec<u8> = (0..3 * 4096 + 100).map(|i| (i % 251) as u8).collect();
        let bootloader = vec![0xBB; 0x2000];
        let signature = vec![0x51; 384];
        (elf, bootloader, signature)
    }

    fn firmware<'a>(elf: &'a [u8], bootloader: &'a [u8], signature: &'a [u8]) -> PrimaryFirmware<'a> {
        PrimaryFirmware {
            elf,
            bootloader,
            sections: BootloaderSections {
                code_offset: 0x100,
                code_size: 0x1000,
                data_offset: 0x1100,
                data_size: 0x800,
                manifest_offset: 0x1900,
            },
            signature,
        }
    }

    fn activate_wpr2(session: &mut BringupSession<'_, EmulatedGpu>) {
        let img = VbiosBuilder::default().build();
        let mut ucode = session.extract_fwsec(&img).unwrap();
        let region = session.run_fwsec_frts(&mut ucode, FRTS_OFFSET).unwrap();
        assert_eq!(region.lo, FRTS_OFFSET);
        assert_eq!(region.hi, FRTS_OFFSET + 0x10_0000);
    }

    #[test]
    fn full_pipeline_from_vbios_to_rpc_channel() {
        let mut dev = EmulatedGpu::new(&ADA_CONFIG);
        // Version-2 fuse; the image advertises versions 1 and 2.
        dev.set_fuse_version(ADA_CONFIG.fuse_gsp_ucode_version_base, 1, 0b10);

        let mut session = BringupSession::new(&mut dev, &ADA_CONFIG);
        activate_wpr2(&mut session);

        let (elf, bootloader, signature) = firmware_images();
        session
            .boot_primary_core(&firmware(&elf, &bootloader, &signature))
            .unwrap();

        // Firmware init completes asynchronously; the event arrives on
        // the status queue.
        assert_eq!(session.rpc_poll_event().unwrap(), Some(RpcEvent::InitDone));
        assert!(session.init_done());

        let info = GspSystemInfo {
            pci_vendor_id: 0x10DE,
            pci_device_id: 0x2684,
            fb_phys_size: 24 << 30,
            ..Default::default()
        };
        let reply = session.rpc_set_system_info(&info).unwrap();
        assert_eq!(reply.header.function, FN_GSP_SET_SYSTEM_INFO);
        assert_eq!(reply.params, info.as_bytes());

        drop(session);
        assert!(dev.gsp_running());
        assert_eq!(dev.rpc_log(), &[FN_GSP_SET_SYSTEM_INFO]);
    }

    #[test]
    fn second_frts_run_sees_region_already_active() {
        let mut dev = EmulatedGpu::new(&ADA_CONFIG);
        let mut session = BringupSession::new(&mut dev, &ADA_CONFIG);
        activate_wpr2(&mut session);

        let img = VbiosBuilder::default().build();
        let mut ucode = session.extract_fwsec(&img).unwrap();
        let err = session.run_fwsec_frts(&mut ucode, FRTS_OFFSET).unwrap_err();
        assert!(matches!(err, BringupError::RegionAlreadyActive { .. }));
    }

    #[test]
    fn hung_ucode_times_out_instead_of_hanging() {
        let mut dev = EmulatedGpu::new(&ADA_CONFIG);
        dev.faults_mut().never_halt = true;
        let mut session = BringupSession::new(&mut dev, &ADA_CONFIG);

        let img = VbiosBuilder::default().build();
        let mut ucode = session.extract_fwsec(&img).unwrap();
        let err = session.run_fwsec_frts(&mut ucode, FRTS_OFFSET).unwrap_err();
        assert!(matches!(err, BringupError::Timeout { .. }));
    }

    #[test]
    fn frts_failure_code_surfaces_from_scratch_register() {
        let mut dev = EmulatedGpu::new(&ADA_CONFIG);
        dev.faults_mut().frts_error = Some(0xA5);
        let mut session = BringupSession::new(&mut dev, &ADA_CONFIG);

        let img = VbiosBuilder::default().build();
        let mut ucode = session.extract_fwsec(&img).unwrap();
        match session.run_fwsec_frts(&mut ucode, FRTS_OFFSET).unwrap_err() {
            BringupError::ExecutionFailed { code, snapshot } => {
                assert_eq!(code, 0xA5);
                assert_eq!(snapshot.scratch_error, 0xA5);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn clean_halt_without_wpr2_is_region_not_activated() {
        let mut dev = EmulatedGpu::new(&ADA_CONFIG);
        dev.faults_mut().refuse_wpr2 = true;
        let mut session = BringupSession::new(&mut dev, &ADA_CONFIG);

        let img = VbiosBuilder::default().build();
        let mut ucode = session.extract_fwsec(&img).unwrap();
        let err = session.run_fwsec_frts(&mut ucode, FRTS_OFFSET).unwrap_err();
        assert!(matches!(err, BringupError::RegionNotActivated { .. }));
    }

    #[test]
    fn source_priority_falls_through_to_a_working_ucode() {
        let mut dev = EmulatedGpu::new(&ADA_CONFIG);
        let mut session = BringupSession::new(&mut dev, &ADA_CONFIG);

        // First source needs a signature version the fuses do not
        // allow; the second one carries version 1 and succeeds.
        let bad = VbiosBuilder {
            ucode_id: 2,
            signature_versions: 0x2,
            ..Default::default()
        }
        .build();
        let good = VbiosBuilder::default().build();
        let mut sources = vec![
            session.extract_fwsec(&bad).unwrap(),
            session.extract_fwsec(&good).unwrap(),
        ];
        let region = session
            .activate_protected_region(&mut sources, FRTS_OFFSET)
            .unwrap();
        assert_eq!(region.lo, FRTS_OFFSET);
    }

    #[test]
    fn unanswered_rpc_times_out() {
        let mut dev = EmulatedGpu::new(&ADA_CONFIG);
        dev.faults_mut().drop_rpc_replies = true;
        let mut session = BringupSession::new(&mut dev, &ADA_CONFIG);
        activate_wpr2(&mut session);

        let (elf, bootloader, signature) = firmware_images();
        session
            .boot_primary_core(&firmware(&elf, &bootloader, &signature))
            .unwrap();
        assert_eq!(session.rpc_poll_event().unwrap(), Some(RpcEvent::InitDone));

        let err = session.rpc_call(FN_GSP_RM_CONTROL, vec![1, 2, 3]).unwrap_err();
        assert_eq!(
            err,
            BringupError::QueueTimeout {
                function: FN_GSP_RM_CONTROL
            }
        );
    }

    #[test]
    fn rpc_before_wpr2_activation_is_rejected() {
        let mut dev = EmulatedGpu::new(&ADA_CONFIG);
        let mut session = BringupSession::new(&mut dev, &ADA_CONFIG);
        let (elf, bootloader, signature) = firmware_images();
        let err = session
            .boot_primary_core(&firmware(&elf, &bootloader, &signature))
            .unwrap_err();
        assert!(matches!(err, BringupError::Usage(_)));
    }
}
